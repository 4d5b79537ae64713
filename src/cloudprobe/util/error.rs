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

use std::error::Error;

pub type DynError = Box<dyn Error + Send + Sync>;
pub type DynResult<T> = Result<T, DynError>;

#[derive(Debug, thiserror::Error)]
#[error("{context}: {source}")]
struct ContextError {
    context: String,
    #[source]
    source: DynError,
}

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
struct SimpleError(String);

pub fn with_context<E>(error: E, context: impl Into<String>) -> DynError
where
    E: Into<DynError>,
{
    Box::new(ContextError {
        context: context.into(),
        source: error.into(),
    })
}

pub fn new_error(message: impl Into<String>) -> DynError {
    Box::new(SimpleError(message.into()))
}

/// Renders `error` followed by every distinct message in its source chain,
/// joined with `: `. Messages already contained in the previous level are
/// skipped so wrapped errors are not printed twice.
pub fn render_chain(error: &(dyn Error + 'static)) -> String {
    let mut rendered = error.to_string();
    let mut current = error.source();
    while let Some(source) = current {
        let message = source.to_string();
        if !rendered.contains(&message) {
            rendered.push_str(": ");
            rendered.push_str(&message);
        }
        current = source.source();
    }
    rendered
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn context_wraps_and_exposes_source() {
        let error = with_context(io::Error::other("connection refused"), "cannot reach keystone");
        assert_eq!(error.to_string(), "cannot reach keystone: connection refused");
        assert!(error.source().is_some());
    }

    #[derive(Debug, thiserror::Error)]
    #[error("upload failed")]
    struct Outer(#[source] io::Error);

    #[test]
    fn render_chain_appends_hidden_sources_once() {
        let outer = Outer(io::Error::other("broken pipe"));
        assert_eq!(render_chain(&outer), "upload failed: broken pipe");

        let wrapped = with_context(new_error("quota exceeded"), "create volume");
        assert_eq!(render_chain(wrapped.as_ref()), "create volume: quota exceeded");
    }
}
