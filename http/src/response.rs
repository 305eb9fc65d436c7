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

use crate::cookie::Cookie;
use crate::fsutil;
use webserv_deps::chrono::Utc;
use webserv_log::*;

warn!();

/// The Server token sent with every response.
pub const SERVER_NAME: &str = "webserv/1.0";

pub const HTTP_OK: u16 = 200;
pub const HTTP_CREATED: u16 = 201;
pub const HTTP_NO_CONTENT: u16 = 204;
pub const HTTP_FOUND: u16 = 302;
pub const HTTP_BAD_REQUEST: u16 = 400;
pub const HTTP_FORBIDDEN: u16 = 403;
pub const HTTP_NOT_FOUND: u16 = 404;
pub const HTTP_METHOD_NOT_ALLOWED: u16 = 405;
pub const HTTP_REQUEST_TIMEOUT: u16 = 408;
pub const HTTP_PAYLOAD_TOO_LARGE: u16 = 413;
pub const HTTP_INTERNAL_SERVER_ERROR: u16 = 500;
pub const HTTP_NOT_IMPLEMENTED: u16 = 501;

pub fn status_message(status_code: u16) -> &'static str {
	match status_code {
		200 => "OK",
		201 => "Created",
		204 => "No Content",
		206 => "Partial Content",
		301 => "Moved Permanently",
		302 => "Found",
		400 => "Bad Request",
		403 => "Forbidden",
		404 => "Not Found",
		405 => "Method Not Allowed",
		408 => "Request Timeout",
		413 => "Payload Too Large",
		500 => "Internal Server Error",
		501 => "Not Implemented",
		502 => "Bad Gateway",
		503 => "Service Unavailable",
		_ => "Unknown",
	}
}

fn http_date() -> String {
	Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// An HTTP response under construction. Headers keep their insertion order
/// and original casing on output.
#[derive(Debug, Clone)]
pub struct Response {
	status_code: u16,
	headers: Vec<(String, String)>,
	body: Vec<u8>,
	complete: bool,
	bytes_sent: usize,
}

impl Response {
	pub fn new() -> Self {
		Self::with_status(HTTP_OK)
	}

	pub fn with_status(status_code: u16) -> Self {
		let mut response = Self {
			status_code,
			headers: vec![],
			body: vec![],
			complete: false,
			bytes_sent: 0,
		};
		response.add_default_headers();
		response
	}

	fn add_default_headers(&mut self) {
		self.set_header("Server", SERVER_NAME);
		self.set_header("Date", &http_date());
		// the Connection header is set later based on keep-alive status
	}

	pub fn status_code(&self) -> u16 {
		self.status_code
	}

	pub fn set_status(&mut self, status_code: u16) {
		self.status_code = status_code;
	}

	/// Set a header, replacing an existing one whose name matches case
	/// insensitively.
	pub fn set_header(&mut self, name: &str, value: &str) {
		for (existing, existing_value) in self.headers.iter_mut() {
			if existing.eq_ignore_ascii_case(name) {
				*existing_value = value.to_string();
				return;
			}
		}
		self.headers.push((name.to_string(), value.to_string()));
	}

	/// Append a header without replacing earlier occurrences. Needed for
	/// Set-Cookie which may legitimately repeat.
	pub fn add_header(&mut self, name: &str, value: &str) {
		self.headers.push((name.to_string(), value.to_string()));
	}

	pub fn header(&self, name: &str) -> Option<&str> {
		self.headers
			.iter()
			.find(|(existing, _)| existing.eq_ignore_ascii_case(name))
			.map(|(_, value)| value.as_str())
	}

	pub fn has_header(&self, name: &str) -> bool {
		self.header(name).is_some()
	}

	pub fn remove_header(&mut self, name: &str) {
		self.headers
			.retain(|(existing, _)| !existing.eq_ignore_ascii_case(name));
	}

	pub fn headers(&self) -> &Vec<(String, String)> {
		&self.headers
	}

	pub fn body(&self) -> &Vec<u8> {
		&self.body
	}

	/// Set the body, keeping Content-Length accurate.
	pub fn set_body(&mut self, body: &[u8]) {
		self.body = body.to_vec();
		self.set_header("Content-Length", &format!("{}", self.body.len()));
	}

	pub fn set_cookie(&mut self, cookie: &Cookie) {
		if cookie.is_valid() {
			self.add_header("Set-Cookie", &cookie.to_string());
		}
	}

	pub fn set_complete(&mut self, complete: bool) {
		self.complete = complete;
	}

	pub fn is_complete(&self) -> bool {
		self.complete
	}

	pub fn bytes_sent(&self) -> usize {
		self.bytes_sent
	}

	pub fn add_bytes_sent(&mut self, bytes: usize) {
		self.bytes_sent += bytes;
	}

	pub fn reset(&mut self) {
		*self = Self::new();
	}

	/// Serialize the status line, headers and optionally the body. A
	/// Transfer-Encoding header is suppressed when a Content-Length is
	/// present (or the encoding is identity), the two must not disagree.
	pub fn to_bytes(&self, with_body: bool) -> Vec<u8> {
		let mut out: Vec<u8> = vec![];
		out.extend_from_slice(
			format!(
				"HTTP/1.1 {} {}\r\n",
				self.status_code,
				status_message(self.status_code)
			)
			.as_bytes(),
		);

		let has_content_length = self.has_header("Content-Length");
		let identity = self
			.header("Transfer-Encoding")
			.map(|v| v.to_lowercase() == "identity")
			.unwrap_or(false);
		let skip_te = has_content_length || identity;

		for (name, value) in &self.headers {
			if skip_te && name.eq_ignore_ascii_case("Transfer-Encoding") {
				continue;
			}
			out.extend_from_slice(format!("{}: {}\r\n", name, value).as_bytes());
		}
		out.extend_from_slice("\r\n".as_bytes());
		if with_body {
			out.extend_from_slice(&self.body);
		}
		out
	}

	/// An error response. When an error page file is configured and present
	/// it supplies the body, otherwise a built-in page carrying the status
	/// code is used. A 405 carries an explicit empty body so clients that do
	/// not read error bodies stay aligned on the next pipelined request.
	pub fn error_response(status_code: u16, error_page: Option<&str>) -> Self {
		let mut response = Self::with_status(status_code);

		if status_code == HTTP_METHOD_NOT_ALLOWED {
			response.set_header("Content-Type", "text/plain");
			response.set_body(b"");
			response.set_complete(true);
			return response;
		}

		let mut body = None;
		if let Some(error_page) = error_page {
			if fsutil::file_exists(error_page) {
				match fsutil::read_file(error_page) {
					Ok(content) => {
						let mime = match fsutil::file_extension(error_page) {
							Some(ext) => fsutil::mime_type(ext),
							None => "text/html",
						};
						response.set_header("Content-Type", mime);
						body = Some(content);
					}
					Err(e) => {
						warn!("failed to read error page {}: {}", error_page, e.kind())
					}
				}
			}
		}

		let body = match body {
			Some(body) => body,
			None => {
				response.set_header("Content-Type", "text/html");
				format!(
					"<!DOCTYPE html>\n\
					 <html><head><title>{} {}</title></head>\n\
					 <body><h1>{} {}</h1>\n\
					 <hr><p>{}</p></body></html>\n",
					status_code,
					status_message(status_code),
					status_code,
					status_message(status_code),
					SERVER_NAME
				)
				.into_bytes()
			}
		};

		response.set_body(&body);
		response.set_complete(true);
		response
	}

	pub fn redirect_response(status_code: u16, location: &str) -> Self {
		let mut response = Self::with_status(status_code);
		response.set_header("Location", location);
		response.set_header("Content-Type", "text/html");
		let body = format!(
			"<!DOCTYPE html>\n\
			 <html><head><title>{} {}</title></head>\n\
			 <body><h1>{} {}</h1>\n\
			 <p>The document has moved <a href=\"{}\">here</a>.</p>\n\
			 <hr><p>{}</p></body></html>\n",
			status_code,
			status_message(status_code),
			status_code,
			status_message(status_code),
			location,
			SERVER_NAME
		);
		response.set_body(body.as_bytes());
		response.set_complete(true);
		response
	}

	pub fn file_response(path: &str, mime_type: &str) -> Self {
		if !fsutil::file_exists(path) {
			return Self::error_response(crate::response::HTTP_NOT_FOUND, None);
		}
		let content = match fsutil::read_file(path) {
			Ok(content) => content,
			Err(e) => {
				warn!("failed to read file {}: {}", path, e.kind());
				return Self::error_response(HTTP_INTERNAL_SERVER_ERROR, None);
			}
		};

		let mut response = Self::new();
		response.set_header("Content-Type", mime_type);
		response.set_body(&content);
		response.set_complete(true);
		response
	}

	pub fn directory_listing_response(path: &str, uri: &str) -> Self {
		let html = match fsutil::autoindex_html(path, uri) {
			Ok(html) => html,
			Err(e) => {
				warn!("failed to list directory {}: {}", path, e.kind());
				return Self::error_response(HTTP_NOT_FOUND, None);
			}
		};
		let mut response = Self::new();
		response.set_header("Content-Type", "text/html");
		response.set_body(html.as_bytes());
		response.set_complete(true);
		response
	}
}
