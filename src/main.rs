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

use std::process;

use clap::Parser;

use cloudprobe::cloudprobe::cli::{self, CloudProbe};
use cloudprobe::cloudprobe::logger::log_error;
use cloudprobe::cloudprobe::util::error::render_chain;

#[tokio::main]
async fn main() {
    let cli = CloudProbe::parse();
    if let Err(err) = cli::run(&cli).await {
        log_error("cli", "Command failed", &[("error", &render_chain(err.as_ref()))]);
        process::exit(1);
    }
}
