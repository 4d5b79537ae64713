/*
 * Copyright (C) 2024 The Cloudprobe Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! Object store probe: round-trips a synthetic payload through a fresh
//! container.

use std::io;

use bytes::Bytes;
use futures_util::stream::{self, StreamExt};
use prometheus::GaugeVec;

use super::{Deadline, ProbeContext, ProbeFailure, ProbeResult, Stage, StepRecorder};
use crate::cloudprobe::logger::{log_info, log_warn};
use crate::cloudprobe::naming::new_run_name;
use crate::cloudprobe::observability::tracing;
use crate::cloudprobe::openstack::types::ObjectBody;

const COMPONENT: &str = "storage";
const CHUNK_SIZE: usize = 64 * 1024;

static ZERO_CHUNK: [u8; CHUNK_SIZE] = [0; CHUNK_SIZE];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StorageStage {
    Start,
    Authenticated,
    ContainerCreated,
    ObjectUploaded,
    ObjectDownloaded,
    ObjectDeleted,
    ContainerDeleted,
    End,
}

impl StorageStage {
    pub const ALL: [StorageStage; 8] = [
        StorageStage::Start,
        StorageStage::Authenticated,
        StorageStage::ContainerCreated,
        StorageStage::ObjectUploaded,
        StorageStage::ObjectDownloaded,
        StorageStage::ObjectDeleted,
        StorageStage::ContainerDeleted,
        StorageStage::End,
    ];
}

impl Stage for StorageStage {
    fn as_label(self) -> &'static str {
        match self {
            StorageStage::Start => "start",
            StorageStage::Authenticated => "authenticated",
            StorageStage::ContainerCreated => "container_created",
            StorageStage::ObjectUploaded => "object_uploaded",
            StorageStage::ObjectDownloaded => "object_downloaded",
            StorageStage::ObjectDeleted => "object_deleted",
            StorageStage::ContainerDeleted => "container_deleted",
            StorageStage::End => "end",
        }
    }
}

/// An all-zero upload body of `size` bytes, produced lazily from one shared
/// static chunk.
pub fn zero_payload(size: u64) -> ObjectBody {
    let chunks = stream::unfold(size, |remaining| async move {
        if remaining == 0 {
            return None;
        }
        let len = remaining.min(CHUNK_SIZE as u64) as usize;
        let chunk = Bytes::from_static(&ZERO_CHUNK[..len]);
        Some((Ok::<_, io::Error>(chunk), remaining - len as u64))
    });
    ObjectBody {
        length: size,
        stream: chunks.boxed(),
    }
}

pub async fn execute(ctx: ProbeContext, timing: GaugeVec, deadline: Deadline) -> ProbeResult<()> {
    let mut recorder = StepRecorder::new(COMPONENT, timing, deadline);
    run(&ctx, &mut recorder).await
}

/// Runs one object store probe. A failed step ends the run immediately; any
/// container left behind is reclaimed by the garbage collector.
pub async fn run(ctx: &ProbeContext, recorder: &mut StepRecorder<StorageStage>) -> ProbeResult<()> {
    recorder.record(StorageStage::Start)?;
    let name = new_run_name(&ctx.config.tag_prefix);

    tracing::with_run_span("probe.storage", name.clone(), round_trip(ctx, recorder, &name)).await
}

async fn round_trip(
    ctx: &ProbeContext,
    recorder: &mut StepRecorder<StorageStage>,
    name: &str,
) -> ProbeResult<()> {
    log_info(COMPONENT, "Starting object store probe", &[]);
    let session = ctx
        .provider
        .authenticate()
        .await
        .map_err(ProbeFailure::cloud("authentication failure"))?;
    recorder.record(StorageStage::Authenticated)?;

    session
        .create_container(name)
        .await
        .map_err(ProbeFailure::cloud("failed to create container"))?;
    recorder.record(StorageStage::ContainerCreated)?;

    let size = ctx.config.payload_size;
    session
        .upload_object(name, name, zero_payload(size))
        .await
        .map_err(ProbeFailure::cloud("failed to upload object"))?;
    recorder.record(StorageStage::ObjectUploaded)?;

    let received = session
        .download_object(name, name)
        .await
        .map_err(ProbeFailure::cloud("failed to download object"))?;
    if received != size {
        log_warn(
            COMPONENT,
            "Downloaded object length differs from upload",
            &[
                ("expected", &size.to_string()),
                ("received", &received.to_string()),
            ],
        );
    }
    recorder.record(StorageStage::ObjectDownloaded)?;

    session
        .delete_object(name, name)
        .await
        .map_err(ProbeFailure::cloud("failed to delete object"))?;
    recorder.record(StorageStage::ObjectDeleted)?;

    session
        .delete_container(name)
        .await
        .map_err(ProbeFailure::cloud("failed to delete container"))?;
    recorder.record(StorageStage::ContainerDeleted)?;

    recorder.record(StorageStage::End)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::TryStreamExt;

    #[tokio::test]
    async fn zero_payload_streams_exact_length_in_shared_chunks() {
        let size = 3 * CHUNK_SIZE as u64 + 17;
        let body = zero_payload(size);
        assert_eq!(body.length, size);

        let chunks: Vec<Bytes> = body.stream.try_collect().await.expect("stream");
        assert_eq!(chunks.len(), 4);
        assert_eq!(chunks.last().map(Bytes::len), Some(17));
        assert_eq!(chunks.iter().map(|c| c.len() as u64).sum::<u64>(), size);
        assert!(chunks.iter().all(|c| c.iter().all(|b| *b == 0)));
        assert_eq!(chunks[0].as_ptr(), chunks[1].as_ptr());
    }

    #[tokio::test]
    async fn empty_payload_yields_no_chunks() {
        let chunks: Vec<Bytes> = zero_payload(0).stream.try_collect().await.expect("stream");
        assert!(chunks.is_empty());
    }
}
