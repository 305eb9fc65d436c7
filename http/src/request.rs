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

use std::collections::HashMap;
use std::time::Instant;
use webserv_err::{Error, ErrorKind};
use webserv_log::*;
use webserv_util::{bytes_find, bytes_to_usize_hex, find_header_body_separator, url_decode};

warn!();

// Cap on the raw request capture so a misbehaving peer cannot grow it
// without bound.
const RAW_REQUEST_CAP: usize = 64 * 1024;

const LF: &[u8] = "\n".as_bytes();

/// The state of the incremental request parser.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ParseState {
	RequestLine,
	Headers,
	Body,
	Complete,
	Error,
}

/// An incrementally parsed HTTP/1.1 request. Header names are lower cased,
/// the last occurrence of a repeated header wins. Chunked bodies are decoded
/// in place; see [`Request::parse`].
pub struct Request {
	method: String,
	uri: String,
	version: String,
	headers: HashMap<String, String>,
	body: Vec<u8>,
	raw: Vec<u8>,
	state: ParseState,
	chunked: bool,
	content_length: usize,
	body_received: usize,
	// bytes beyond the current parsing step, preserved for pipelining
	spare: Vec<u8>,
	expected_chunk_size: usize,
	reading_chunk_size: bool,
	reading_trailers: bool,
	chunk_last_activity: Option<Instant>,
}

impl Request {
	pub fn new() -> Self {
		Self {
			method: String::new(),
			uri: String::new(),
			version: String::new(),
			headers: HashMap::new(),
			body: vec![],
			raw: vec![],
			state: ParseState::RequestLine,
			chunked: false,
			content_length: 0,
			body_received: 0,
			spare: vec![],
			expected_chunk_size: 0,
			reading_chunk_size: true,
			reading_trailers: false,
			chunk_last_activity: None,
		}
	}

	/// Feed a fragment of bytes to the parser. Any bytes beyond the current
	/// request are kept in the spare buffer and returned by
	/// [`Request::take_spare`] once the request is complete.
	pub fn parse(&mut self, data: &[u8]) -> ParseState {
		if self.raw.len() < RAW_REQUEST_CAP {
			let can = RAW_REQUEST_CAP - self.raw.len();
			let take = std::cmp::min(can, data.len());
			self.raw.extend_from_slice(&data[0..take]);
		}

		let mut buffer = std::mem::take(&mut self.spare);
		buffer.extend_from_slice(data);

		if self.state == ParseState::RequestLine {
			// tolerate leading empty lines per RFC 7230 3.5
			let mut start = 0;
			loop {
				if buffer.len() >= start + 2 && &buffer[start..start + 2] == b"\r\n" {
					start += 2;
					continue;
				}
				if buffer.len() > start && buffer[start] == b'\n' {
					start += 1;
					continue;
				}
				break;
			}
			if start > 0 {
				buffer.drain(0..start);
			}

			match bytes_find(&buffer, LF) {
				Some(pos) => {
					let line_end = if pos > 0 && buffer[pos - 1] == b'\r' {
						pos - 1
					} else {
						pos
					};
					let line =
						String::from_utf8_lossy(&buffer[0..line_end]).to_string();
					match self.parse_request_line(&line) {
						Ok(_) => {
							self.state = ParseState::Headers;
							buffer.drain(0..pos + 1);
						}
						Err(e) => {
							warn!("failed to parse request line: {}", e.kind());
							self.state = ParseState::Error;
							return self.state;
						}
					}
				}
				None => {
					self.spare = buffer;
					return self.state;
				}
			}
		}

		if self.state == ParseState::Headers {
			match find_header_body_separator(&buffer) {
				Some((end, sep_len)) => {
					let section = buffer[0..end].to_vec();
					for line in section.split(|b| *b == b'\n') {
						let line = if line.last() == Some(&b'\r') {
							&line[0..line.len() - 1]
						} else {
							line
						};
						self.parse_header_line(&String::from_utf8_lossy(line));
					}
					buffer.drain(0..end + sep_len);

					if self.has_header("content-length") {
						self.content_length = self
							.header("content-length")
							.unwrap_or("")
							.trim()
							.parse()
							.unwrap_or(0);
						if self.content_length > 0 {
							self.state = ParseState::Body;
						} else {
							self.state = ParseState::Complete;
						}
					} else if self
						.header("transfer-encoding")
						.map(|v| v.to_lowercase() == "chunked")
						.unwrap_or(false)
					{
						self.chunked = true;
						self.chunk_last_activity = Some(Instant::now());
						self.state = ParseState::Body;
					} else {
						self.state = ParseState::Complete;
					}
				}
				None => {
					self.spare = buffer;
					return self.state;
				}
			}
		}

		if self.state == ParseState::Body && buffer.len() > 0 {
			if self.chunked {
				// any arrival of body bytes counts as activity so long
				// legitimate uploads do not trip the inactivity timeout
				self.chunk_last_activity = Some(Instant::now());
				self.parse_chunked_body(buffer);
				if self.state == ParseState::Complete {
					self.finalize_body();
				}
			} else {
				let bytes_to_read = std::cmp::min(
					buffer.len(),
					self.content_length.saturating_sub(self.body_received),
				);
				self.body.extend_from_slice(&buffer[0..bytes_to_read]);
				self.body_received += bytes_to_read;

				if self.body_received >= self.content_length {
					self.state = ParseState::Complete;
				}
				if buffer.len() > bytes_to_read {
					self.spare = buffer[bytes_to_read..].to_vec();
				}
			}
		} else if self.state == ParseState::Complete || self.state == ParseState::Error {
			self.spare = buffer;
		}

		self.state
	}

	fn parse_chunked_body(&mut self, buffer: Vec<u8>) {
		let mut buf = buffer;

		loop {
			if buf.is_empty() {
				break;
			}
			if self.reading_trailers {
				match bytes_find(&buf, LF) {
					Some(pos) => {
						let line_len = if pos > 0 && buf[pos - 1] == b'\r' {
							pos - 1
						} else {
							pos
						};
						buf.drain(0..pos + 1);
						if line_len == 0 {
							self.state = ParseState::Complete;
							break;
						}
					}
					None => break, // wait for more data
				}
			} else if self.reading_chunk_size {
				match bytes_find(&buf, LF) {
					Some(pos) => {
						let line_end = if pos > 0 && buf[pos - 1] == b'\r' {
							pos - 1
						} else {
							pos
						};
						let line = &buf[0..line_end];
						// a ';' begins chunk extensions, ignored to line end
						let size_part = match bytes_find(line, ";".as_bytes()) {
							Some(p) => &line[0..p],
							None => line,
						};
						match bytes_to_usize_hex(size_part) {
							Ok(size) => {
								self.expected_chunk_size = size;
								self.chunk_last_activity = Some(Instant::now());
								buf.drain(0..pos + 1);
								if size == 0 {
									self.reading_trailers = true;
								} else {
									self.reading_chunk_size = false;
								}
							}
							Err(_e) => {
								warn!("bad chunk size line in request body");
								self.state = ParseState::Error;
								return;
							}
						}
					}
					None => break, // wait for more data
				}
			} else {
				let size = self.expected_chunk_size;
				if buf.len() >= size + 2 && buf[size] == b'\r' && buf[size + 1] == b'\n' {
					self.body.extend_from_slice(&buf[0..size]);
					buf.drain(0..size + 2);
				} else if buf.len() >= size + 1 && buf[size] == b'\n' {
					self.body.extend_from_slice(&buf[0..size]);
					buf.drain(0..size + 1);
				} else if buf.len() <= size + 1 {
					break; // wait for the full chunk plus terminator
				} else {
					warn!("missing chunk terminator in request body");
					self.state = ParseState::Error;
					return;
				}
				self.reading_chunk_size = true;
				self.chunk_last_activity = Some(Instant::now());
			}
		}

		// partial chunk data or a partial size line is kept for the next call
		self.spare = buf;
	}

	fn parse_request_line(&mut self, line: &str) -> Result<(), Error> {
		let tokens: Vec<&str> = line.split_whitespace().collect();
		if tokens.len() != 3 {
			return Err(ErrorKind::HttpParseError(format!(
				"invalid request line: '{}'",
				line
			))
			.into());
		}

		self.method = tokens[0].to_uppercase();

		// absolute-form request targets are reduced to origin-form
		let mut target = tokens[1].to_string();
		if target.starts_with("http://") || target.starts_with("https://") {
			match target.find("://") {
				Some(scheme_end) => {
					target = match target[scheme_end + 3..].find('/') {
						Some(p) => target[scheme_end + 3 + p..].to_string(),
						None => "/".to_string(),
					};
				}
				None => {}
			}
		}
		self.uri = target;
		self.version = tokens[2].to_string();

		if !Self::is_valid_method(&self.method) {
			return Err(ErrorKind::HttpParseError(format!(
				"invalid method: '{}'",
				self.method
			))
			.into());
		}
		if !self.uri.starts_with('/') {
			return Err(
				ErrorKind::HttpParseError(format!("invalid uri: '{}'", self.uri)).into(),
			);
		}
		if self.version != "HTTP/1.1" && self.version != "HTTP/1.0" {
			return Err(ErrorKind::HttpParseError(format!(
				"invalid version: '{}'",
				self.version
			))
			.into());
		}

		Ok(())
	}

	fn parse_header_line(&mut self, line: &str) {
		if line.trim().is_empty() {
			return;
		}
		let colon = match line.find(':') {
			Some(colon) => colon,
			None => {
				debug!("skipping malformed header line: '{}'", line);
				return;
			}
		};
		let name = line[0..colon].trim();
		let value = line[colon + 1..].trim();
		if name.is_empty() {
			debug!("skipping header with empty name: '{}'", line);
			return;
		}
		self.headers.insert(name.to_lowercase(), value.to_string());
	}

	fn is_valid_method(method: &str) -> bool {
		method == "GET"
			|| method == "POST"
			|| method == "DELETE"
			|| method == "PUT"
			|| method == "HEAD"
			|| method == "OPTIONS"
	}

	/// Normalize headers once the body is fully parsed: a decoded chunked
	/// body carries a Content-Length instead of Transfer-Encoding.
	fn finalize_body(&mut self) {
		if self.chunked {
			self.remove_header("transfer-encoding");
			self.content_length = self.body.len();
			self.set_header("content-length", &format!("{}", self.body.len()));
		}
	}

	pub fn reset(&mut self) {
		*self = Self::new();
	}

	pub fn is_complete(&self) -> bool {
		self.state == ParseState::Complete
	}

	pub fn has_error(&self) -> bool {
		self.state == ParseState::Error
	}

	pub fn state(&self) -> ParseState {
		self.state
	}

	pub fn method(&self) -> &str {
		&self.method
	}

	pub fn uri(&self) -> &str {
		&self.uri
	}

	pub fn version(&self) -> &str {
		&self.version
	}

	pub fn headers(&self) -> &HashMap<String, String> {
		&self.headers
	}

	pub fn header(&self, name: &str) -> Option<&str> {
		self.headers.get(&name.to_lowercase()).map(|v| v.as_str())
	}

	pub fn has_header(&self, name: &str) -> bool {
		self.headers.contains_key(&name.to_lowercase())
	}

	pub fn set_header(&mut self, name: &str, value: &str) {
		self.headers.insert(name.to_lowercase(), value.to_string());
	}

	pub fn remove_header(&mut self, name: &str) {
		self.headers.remove(&name.to_lowercase());
	}

	pub fn body(&self) -> &Vec<u8> {
		&self.body
	}

	pub fn raw(&self) -> &Vec<u8> {
		&self.raw
	}

	pub fn content_length(&self) -> usize {
		self.content_length
	}

	pub fn is_chunked(&self) -> bool {
		self.chunked
	}

	/// Bytes that arrived beyond this request. The caller hands them back to
	/// the connection's receive buffer so a pipelined request is not lost.
	pub fn take_spare(&mut self) -> Vec<u8> {
		std::mem::take(&mut self.spare)
	}

	/// Whether the request body is supplied in a streaming fashion (chunked
	/// or a known content length still arriving).
	pub fn is_streaming_mode(&self) -> bool {
		if self.chunked || self.content_length > 0 {
			return true;
		}
		self.method == "POST" || self.method == "PUT"
	}

	/// Whether a chunked upload has gone quiet for longer than the allowed
	/// inactivity window.
	pub fn has_chunked_timeout(&self, timeout_secs: u64) -> bool {
		if !self.chunked || self.state != ParseState::Body {
			return false;
		}
		match self.chunk_last_activity {
			Some(t) => t.elapsed().as_secs() > timeout_secs,
			None => false,
		}
	}

	/// The request-target without its query component.
	pub fn path(&self) -> &str {
		match self.uri.find('?') {
			Some(pos) => &self.uri[0..pos],
			None => &self.uri,
		}
	}

	pub fn query_string(&self) -> &str {
		match self.uri.find('?') {
			Some(pos) => &self.uri[pos + 1..],
			None => "",
		}
	}

	pub fn query_params(&self) -> HashMap<String, String> {
		let mut params = HashMap::new();
		let query = self.query_string();
		if query.is_empty() {
			return params;
		}
		for pair in query.split('&') {
			match pair.find('=') {
				Some(pos) => {
					params.insert(
						url_decode(&pair[0..pos]),
						url_decode(&pair[pos + 1..]),
					);
				}
				None => {
					params.insert(url_decode(pair), "".to_string());
				}
			}
		}
		params
	}
}
