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

//! Utilities for webserv: byte level parsing helpers, the url/chunked codecs
//! and lock macros.

mod byte_utils;
mod codec;
mod macros;

pub use crate::byte_utils::{
	bytes_eq, bytes_find, bytes_to_usize, bytes_to_usize_hex, find_header_body_separator,
};
pub use crate::codec::{chunk_encode, dechunk, url_decode, url_encode};
