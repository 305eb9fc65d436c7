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

//! A single threaded, event driven HTTP/1.1 origin server. Static files,
//! CGI/1.1 execution and per location policy (method allow lists, body size
//! limits, redirects, uploads, autoindex) are driven by an nginx style
//! configuration file. One poll(2) loop multiplexes listening sockets,
//! client sockets and CGI pipes; no component blocks.

mod cgi;
mod client;
mod compression;
mod config;
mod cookie;
mod fsutil;
mod range;
mod request;
mod response;
mod server;
mod session;

pub use crate::cgi::Cgi;
pub use crate::client::{Client, ClientState};
pub use crate::compression::CompressionType;
pub use crate::config::{Config, Location, ServerBlock};
pub use crate::cookie::Cookie;
pub use crate::range::Range;
pub use crate::request::{ParseState, Request};
pub use crate::response::Response;
pub use crate::server::HttpServer;
pub use crate::session::Session;
