// Copyright (c) 2022, The Webserv Developers
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use webserv_deps::clap::{App, Arg};
use webserv_err::Error;
use webserv_http::{Config, HttpServer};
use webserv_log::*;

info!();

const DEFAULT_CONFIG_PATH: &str = "./config/default.conf";

fn main() -> Result<(), Error> {
	let args = App::new("webserv")
		.version(env!("CARGO_PKG_VERSION"))
		.about("An event driven HTTP/1.1 server with CGI/1.1 support")
		.arg(
			Arg::with_name("config")
				.help("Path to the server configuration file")
				.index(1),
		)
		.get_matches();
	let config_file = args.value_of("config").unwrap_or(DEFAULT_CONFIG_PATH);

	info!("=== webserv HTTP server ===");
	info!("version: {}", env!("CARGO_PKG_VERSION"));
	info!("configuration file: {}", config_file);

	let config = Config::load(config_file)?;
	let mut server = HttpServer::new(config);
	server.start()?;
	server.run()?;

	info!("server shutdown complete");
	Ok(())
}
