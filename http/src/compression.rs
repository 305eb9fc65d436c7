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

use std::io::Write;
use webserv_deps::flate2::write::{GzEncoder, ZlibEncoder};
use webserv_deps::flate2::Compression;
use webserv_err::Error;

// Bodies smaller than this are not worth compressing.
const MIN_COMPRESS_SIZE: usize = 1024;

/// The content codings this server can produce.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CompressionType {
	None,
	Gzip,
	Deflate,
}

impl CompressionType {
	/// Negotiate a coding from an Accept-Encoding header value. Gzip is
	/// preferred over deflate.
	pub fn accepted(accept_encoding: &str) -> Self {
		let lower = accept_encoding.to_lowercase();
		if lower.contains("gzip") {
			CompressionType::Gzip
		} else if lower.contains("deflate") {
			CompressionType::Deflate
		} else {
			CompressionType::None
		}
	}

	/// The Content-Encoding token for this coding.
	pub fn encoding_header(&self) -> &'static str {
		match self {
			CompressionType::Gzip => "gzip",
			CompressionType::Deflate => "deflate",
			CompressionType::None => "",
		}
	}

	/// Compress data with this coding. `None` passes the data through.
	pub fn compress(&self, data: &[u8]) -> Result<Vec<u8>, Error> {
		match self {
			CompressionType::Gzip => {
				let mut encoder = GzEncoder::new(vec![], Compression::default());
				encoder.write_all(data)?;
				Ok(encoder.finish()?)
			}
			CompressionType::Deflate => {
				let mut encoder = ZlibEncoder::new(vec![], Compression::default());
				encoder.write_all(data)?;
				Ok(encoder.finish()?)
			}
			CompressionType::None => Ok(data.to_vec()),
		}
	}
}

/// Whether a body of this content type and size is worth compressing.
/// Pre-compressed media types are left alone.
pub fn should_compress(content_type: &str, content_length: usize) -> bool {
	if content_length < MIN_COMPRESS_SIZE {
		return false;
	}
	if content_type.starts_with("image/")
		|| content_type.starts_with("video/")
		|| content_type.starts_with("audio/")
		|| content_type.starts_with("application/zip")
		|| content_type.starts_with("application/gzip")
	{
		return false;
	}
	content_type.starts_with("text/")
		|| content_type.starts_with("application/json")
		|| content_type.starts_with("application/javascript")
		|| content_type.starts_with("application/xml")
		|| content_type.starts_with("application/xhtml")
		|| content_type.is_empty()
}
