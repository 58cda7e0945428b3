// Copyright 2022 The Agentd Developers
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use agentd::bootstrap::BootstrapConfig;
use agentd::command;
use agentd::status::{exit_code, general};

fn main() {
    let args: Vec<String> = std::env::args().collect();
    let search_path = std::env::var("PATH").unwrap_or_default();

    let bconf = match BootstrapConfig::from_args(&args, &search_path) {
        Ok(bconf) => bconf,
        Err(err) => {
            eprintln!("agentd: {}", err);
            std::process::exit(exit_code(general::BAD_ARGUMENT));
        }
    };

    std::process::exit(command::dispatch(&bconf));
}
