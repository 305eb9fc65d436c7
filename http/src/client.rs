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

use crate::cgi::{Cgi, PipeRead};
use crate::compression::{self, CompressionType};
use crate::config::{Config, Location, ServerBlock};
use crate::cookie::Cookie;
use crate::fsutil;
use crate::range::Range;
use crate::request::{ParseState, Request};
use crate::response::*;
use crate::session::{Session, SESSION_COOKIE_NAME};
use std::os::unix::prelude::RawFd;
use std::time::{Duration, Instant};
use webserv_deps::chrono::Utc;
use webserv_deps::nix::errno::Errno;
use webserv_deps::nix::sys::socket::{recv, send, MsgFlags};
use webserv_deps::nix::unistd;
use webserv_log::*;
use webserv_util::find_header_body_separator;

warn!();

const BUFFER_SIZE: usize = 65536;

// The staging buffer between the parsed request body and the CGI stdin pipe
// is bounded so a slow child cannot make the server hoard memory.
const CGI_WRITE_BUFFER_LIMIT: usize = 256 * 1024;

const CHUNKED_UPLOAD_TIMEOUT_SECS: u64 = 30;
const CGI_IDLE_TIMEOUT_SECS: u64 = 600;
const CGI_SWEEP_CLIENT_IDLE_SECS: u64 = 30;

const KEEP_ALIVE_PARAMS: &str = "timeout=600, max=100";
const HTTP_CONTINUE_100: &[u8] = b"HTTP/1.1 100 Continue\r\n\r\n";

/// The per-connection state machine.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ClientState {
	ReceivingRequest,
	ProcessingRequest,
	SendingResponse,
	CgiProcessing,
	CgiStreamingBody,
	Finished,
	Error,
}

/// One client connection. A Client exclusively owns its socket and at most
/// one CGI child; it is a move-only value living in the reactor's client
/// table, and dropping it releases both.
pub struct Client {
	fd: RawFd,
	state: ClientState,
	server_index: usize,
	remote_addr: String,
	request: Request,
	response: Response,
	recv_buffer: Vec<u8>,
	send_buffer: Vec<u8>,
	cgi: Option<Cgi>,
	cgi_output: Vec<u8>,
	cgi_stage: Vec<u8>,
	cgi_body_offset: usize,
	cgi_bytes_written: usize,
	// None while the CGI has not declared a Content-Length (deferred mode)
	cgi_body_remaining: Option<usize>,
	keep_alive: bool,
	peer_closed: bool,
	cgi_headers_sent: bool,
	sent_100_continue: bool,
	cgi_finalized: bool,
	last_activity: Instant,
}

impl Client {
	pub fn new(fd: RawFd, server_index: usize, remote_addr: String) -> Self {
		Self {
			fd,
			state: ClientState::ReceivingRequest,
			server_index,
			remote_addr,
			request: Request::new(),
			response: Response::new(),
			recv_buffer: vec![],
			send_buffer: vec![],
			cgi: None,
			cgi_output: vec![],
			cgi_stage: vec![],
			cgi_body_offset: 0,
			cgi_bytes_written: 0,
			cgi_body_remaining: None,
			keep_alive: false,
			peer_closed: false,
			cgi_headers_sent: false,
			sent_100_continue: false,
			cgi_finalized: false,
			last_activity: Instant::now(),
		}
	}

	pub fn fd(&self) -> RawFd {
		self.fd
	}

	pub fn state(&self) -> ClientState {
		self.state
	}

	pub fn set_state(&mut self, state: ClientState) {
		self.state = state;
	}

	pub fn request(&self) -> &Request {
		&self.request
	}

	pub fn response(&self) -> &Response {
		&self.response
	}

	pub fn is_keep_alive(&self) -> bool {
		self.keep_alive
	}

	pub fn has_pending_send(&self) -> bool {
		!self.send_buffer.is_empty()
	}

	pub fn has_buffered_request_bytes(&self) -> bool {
		!self.recv_buffer.is_empty()
	}

	pub fn mark_peer_closed(&mut self) {
		self.peer_closed = true;
	}

	pub fn has_peer_closed(&self) -> bool {
		self.peer_closed
	}

	pub fn update_last_activity(&mut self) {
		self.last_activity = Instant::now();
	}

	pub fn has_timed_out(&self, timeout_secs: u64) -> bool {
		self.last_activity.elapsed().as_secs() > timeout_secs
	}

	pub fn in_cgi_state(&self) -> bool {
		self.state == ClientState::CgiProcessing || self.state == ClientState::CgiStreamingBody
	}

	pub fn cgi_input_fd(&self) -> Option<RawFd> {
		self.cgi.as_ref().and_then(|cgi| cgi.input_fd())
	}

	pub fn cgi_output_fd(&self) -> Option<RawFd> {
		self.cgi.as_ref().and_then(|cgi| cgi.output_fd())
	}

	/// Whether the CGI stdin pipe should be polled for writability. The
	/// staging buffer being empty is not enough to stop polling: a POLLOUT
	/// event is what stages the remaining request body bytes late in an
	/// upload.
	pub fn is_waiting_for_cgi_write(&self) -> bool {
		self.in_cgi_state() && self.cgi_input_fd().is_some()
	}

	/// Read from the socket into the receive buffer. A zero byte read marks
	/// the peer closed, and finishes the connection when nothing is pending
	/// in either direction.
	pub fn receive(&mut self) {
		let mut buffer = [0u8; BUFFER_SIZE];
		match recv(self.fd, &mut buffer, MsgFlags::empty()) {
			Ok(0) => {
				self.peer_closed = true;
				if self.send_buffer.is_empty()
					&& self.state == ClientState::ReceivingRequest
					&& self.recv_buffer.is_empty()
					&& self.request.state() == ParseState::RequestLine
				{
					self.state = ClientState::Finished;
				}
			}
			Ok(n) => {
				self.recv_buffer.extend_from_slice(&buffer[0..n]);
				self.update_last_activity();
			}
			Err(Errno::EAGAIN) => {}
			Err(e) => {
				warn!("recv failed on fd {}: {}", self.fd, e);
				self.state = ClientState::Error;
			}
		}
	}

	/// Drain the send buffer to the socket. Once the response has fully
	/// left, a keep-alive connection resets for the next request; the reset
	/// is deferred while the current request body is still arriving so
	/// trailing body bytes are not parsed as a new request.
	pub fn send_data(&mut self) {
		if self.send_buffer.is_empty() {
			return;
		}
		match send(self.fd, &self.send_buffer, MsgFlags::MSG_NOSIGNAL) {
			Ok(n) if n > 0 => {
				self.send_buffer.drain(0..n);
				self.response.add_bytes_sent(n);
				self.update_last_activity();
				if self.send_buffer.is_empty() && self.state == ClientState::SendingResponse
				{
					if self.keep_alive {
						if self.request.is_complete() {
							self.reset();
							self.state = ClientState::ReceivingRequest;
						} else {
							debug!("holding fd {} open to drain request body before keep-alive reuse", self.fd);
						}
					} else {
						self.state = ClientState::Finished;
					}
				}
			}
			Ok(_) => {}
			Err(Errno::EAGAIN) => {}
			Err(e) => {
				warn!("send failed on fd {}: {}", self.fd, e);
				self.state = ClientState::Error;
			}
		}
	}

	/// Parse buffered bytes and drive the request through routing, policy
	/// checks and the per-method handlers.
	pub fn process_request(&mut self, config: &Config) {
		let server_index = std::cmp::min(self.server_index, config.servers().len() - 1);
		let server = &config.servers()[server_index];

		// Only parse while ready for (more of) the current request. Bytes
		// of a pipelined request wait in the receive buffer until reset().
		// A response queued before the body finished (413, 408) keeps the
		// parser consuming the current body so the channel can be reused.
		let draining =
			self.state == ClientState::SendingResponse && !self.request.is_complete();
		if !self.recv_buffer.is_empty()
			&& (self.state == ClientState::ReceivingRequest || draining)
		{
			let data = std::mem::take(&mut self.recv_buffer);
			let parse_state = self.request.parse(&data);

			if parse_state == ParseState::Complete || parse_state == ParseState::Error {
				// leftover bytes belong to the next pipelined request
				self.recv_buffer = self.request.take_spare();
			}

			if draining {
				match parse_state {
					ParseState::Complete => {
						// the response went out already; reuse the channel
						// once it has fully drained
						if self.send_buffer.is_empty() && self.keep_alive {
							self.reset();
							self.state = ClientState::ReceivingRequest;
						}
					}
					ParseState::Error => {
						self.state = ClientState::Finished;
					}
					_ => {}
				}
				return;
			}

			// interim 100 Continue, exactly once, as soon as headers are in
			if !self.sent_100_continue && self.request.state() == ParseState::Body {
				let expects_continue = self
					.request
					.header("expect")
					.map(|v| v.to_lowercase().contains("100-continue"))
					.unwrap_or(false);
				if expects_continue {
					let mut prefixed = HTTP_CONTINUE_100.to_vec();
					prefixed.extend_from_slice(&self.send_buffer);
					self.send_buffer = prefixed;
					self.sent_100_continue = true;
					debug!("queued interim 100 Continue on fd {}", self.fd);
				}
			}

			if parse_state == ParseState::Error {
				let response = self.error_response_for(server, HTTP_BAD_REQUEST);
				self.queue_response(response);
				return;
			}
			if parse_state == ParseState::Complete {
				// never clobber CGI states; the reactor keeps polling the
				// pipes until the CGI flow finishes
				if !self.in_cgi_state() {
					self.state = ClientState::ProcessingRequest;
				}
			}
		}

		let location = if self.request.uri().is_empty() {
			None
		} else {
			server.find_location(self.request.uri())
		};
		let allowed_max = location
			.map(|l| l.max_body_size())
			.unwrap_or(server.max_body_size);

		// a chunked upload that went quiet
		if self.state == ClientState::ReceivingRequest
			&& self.request.has_chunked_timeout(CHUNKED_UPLOAD_TIMEOUT_SECS)
		{
			error!("chunked upload timeout on fd {}", self.fd);
			let response = self.error_response_for(server, HTTP_REQUEST_TIMEOUT);
			self.queue_response(response);
			return;
		}

		// early 413: the declared length alone already exceeds the limit
		if self.state == ClientState::ReceivingRequest
			&& self.request.state() == ParseState::Body
			&& self.request.content_length() > allowed_max
		{
			let response = self.error_response_for(server, HTTP_PAYLOAD_TOO_LARGE);
			self.queue_response(response);
			return;
		}

		// CGI-mapped POST: spawn once the body is complete (size known,
		// dechunking done). Only while no response has been queued yet.
		let awaiting_dispatch = self.state == ClientState::ReceivingRequest
			|| self.state == ClientState::ProcessingRequest;
		if let Some(location) = location {
			if awaiting_dispatch
				&& location.is_cgi_request(self.request.uri())
				&& self.cgi.is_none()
			{
				let method = self.request.method().to_string();
				if !method.is_empty() && !location.is_method_allowed(&method) {
					let mut response =
						self.error_response_for(server, HTTP_METHOD_NOT_ALLOWED);
					let allow = location.allowed_methods().join(", ");
					if !allow.is_empty() {
						response.set_header("Allow", &allow);
					}
					self.queue_response(response);
					return;
				}
				if method == "POST" {
					if !self.request.is_complete() {
						return;
					}
					if self.request.content_length() > allowed_max
						|| self.request.body().len() > allowed_max
					{
						let response =
							self.error_response_for(server, HTTP_PAYLOAD_TOO_LARGE);
						self.queue_response(response);
						return;
					}

					let script_path = location.full_path(self.request.path());
					let server_name = server
						.server_names
						.first()
						.map(|s| s.as_str())
						.unwrap_or(server.host.as_str());
					let mut cgi =
						Cgi::new(location.cgi_path(), location.cgi_extension());
					let remote_addr = self.remote_addr.clone();
					match cgi.execute(
						&self.request,
						&script_path,
						server_name,
						server.port,
						&remote_addr,
					) {
						Ok(_) => {}
						Err(e) => {
							error!("CGI spawn failed: {}", e.kind());
							let response = self.error_response_for(
								server,
								HTTP_INTERNAL_SERVER_ERROR,
							);
							self.queue_response(response);
							return;
						}
					}

					self.cgi = Some(cgi);
					self.cgi_stage.clear();
					self.cgi_bytes_written = 0;
					self.cgi_body_offset = 0;
					self.state = ClientState::CgiProcessing;
					self.update_last_activity();
					// push the first slice of the body right away
					self.handle_cgi_input();
					return;
				}
				// GET/HEAD on a CGI location fall through and may serve the
				// script file as static content
			}
		}

		if self.state == ClientState::ProcessingRequest && self.request.is_complete() {
			if self.request.content_length() > allowed_max
				|| self.request.body().len() > allowed_max
			{
				let response = self.error_response_for(server, HTTP_PAYLOAD_TOO_LARGE);
				self.queue_response(response);
				return;
			}

			if let Some(location) = location {
				if !location.is_method_allowed(self.request.method()) {
					let mut response =
						self.error_response_for(server, HTTP_METHOD_NOT_ALLOWED);
					let allow = location.allowed_methods().join(", ");
					if !allow.is_empty() {
						response.set_header("Allow", &allow);
					}
					self.queue_response(response);
					return;
				}
				if let Some(redirect) = location.redirect() {
					let response = Response::redirect_response(HTTP_FOUND, redirect);
					self.queue_response(response);
					return;
				}
			}

			debug!(
				"processing {} {} on fd {}",
				self.request.method(),
				self.request.path(),
				self.fd
			);
			let mut response = match self.request.method() {
				"GET" | "HEAD" => self.handle_get(server, location),
				"POST" => self.handle_post(server, location),
				"PUT" => self.handle_put(server, location),
				"DELETE" => self.handle_delete(server, location),
				_ => self.error_response_for(server, HTTP_NOT_IMPLEMENTED),
			};

			self.apply_response_hooks(&mut response);
			self.queue_response(response);
		}
	}

	/// Compute keep-alive intent, stamp Connection headers and serialize the
	/// response behind whatever is already queued (an unsent interim 100
	/// Continue stays in front).
	fn queue_response(&mut self, mut response: Response) {
		self.compute_keep_alive();
		response.set_header(
			"Connection",
			if self.keep_alive { "keep-alive" } else { "close" },
		);
		if self.keep_alive {
			response.set_header("Keep-Alive", KEEP_ALIVE_PARAMS);
		}
		let with_body = self.request.method() != "HEAD";
		self.send_buffer
			.extend_from_slice(&response.to_bytes(with_body));
		self.response = response;
		self.state = ClientState::SendingResponse;
	}

	fn compute_keep_alive(&mut self) {
		let connection = self
			.request
			.header("connection")
			.unwrap_or("")
			.to_lowercase();
		let is_http11 = self.request.version() == "HTTP/1.1";
		self.keep_alive = if is_http11 {
			connection != "close"
		} else {
			connection == "keep-alive"
		};
	}

	fn error_response_for(&self, server: &ServerBlock, status_code: u16) -> Response {
		let error_page = server.error_pages.get(&status_code).map(|p| p.as_str());
		Response::error_response(status_code, error_page)
	}

	/// Map the request path onto the filesystem and refuse paths that
	/// escape the document root.
	fn map_path(
		&self,
		server: &ServerBlock,
		location: Option<&Location>,
	) -> Result<String, Response> {
		let uri_path = self.request.path();
		let raw = match location {
			Some(location) => location.full_path(uri_path),
			None => format!("{}{}", server.root, uri_path),
		};
		let root = location.map(|l| l.root()).unwrap_or(server.root.as_str());
		let root_clean = fsutil::clean_path(root);
		let clean = fsutil::clean_path(&raw);
		if !clean.starts_with(&root_clean) {
			return Err(self.error_response_for(server, HTTP_FORBIDDEN));
		}
		Ok(clean)
	}

	fn handle_get(&self, server: &ServerBlock, location: Option<&Location>) -> Response {
		let full_path = match self.map_path(server, location) {
			Ok(full_path) => full_path,
			Err(response) => return response,
		};

		if fsutil::is_directory(&full_path) {
			let index = location.map(|l| l.index()).unwrap_or(server.index.as_str());
			if !index.is_empty() {
				let mut index_path = full_path.clone();
				if !index_path.ends_with('/') {
					index_path.push('/');
				}
				index_path += index;
				if fsutil::file_exists(&index_path) {
					return Response::file_response(
						&index_path,
						mime_for(&index_path),
					);
				}
			}
			let autoindex = location.map(|l| l.autoindex()).unwrap_or(false);
			if autoindex {
				return Response::directory_listing_response(
					&full_path,
					self.request.path(),
				);
			}
			return self.error_response_for(server, HTTP_NOT_FOUND);
		}

		if !fsutil::file_exists(&full_path) {
			return self.error_response_for(server, HTTP_NOT_FOUND);
		}
		Response::file_response(&full_path, mime_for(&full_path))
	}

	fn handle_post(&self, server: &ServerBlock, location: Option<&Location>) -> Response {
		let location = match location {
			Some(location) => location,
			None => return self.error_response_for(server, HTTP_NOT_IMPLEMENTED),
		};

		// CGI-mapped POSTs were diverted before dispatch
		if location.is_cgi_request(self.request.uri()) {
			return self.error_response_for(server, HTTP_INTERNAL_SERVER_ERROR);
		}

		if let Some(upload_path) = location.upload_path() {
			let path = self.request.path();
			let mut filename = match path.rfind('/') {
				Some(pos) => path[pos + 1..].to_string(),
				None => path.to_string(),
			};
			if filename.is_empty() {
				filename = format!("upload_{}", Utc::now().timestamp());
			}
			let full_path = format!("{}/{}", upload_path, filename);

			return match fsutil::write_file(&full_path, self.request.body()) {
				Ok(_) => {
					let mut response = Response::with_status(HTTP_CREATED);
					response.set_header("Content-Type", "text/plain");
					response.set_body(b"File uploaded successfully");
					response.set_complete(true);
					response
				}
				Err(e) => {
					error!("upload to {} failed: {}", full_path, e.kind());
					self.error_response_for(server, HTTP_INTERNAL_SERVER_ERROR)
				}
			};
		}

		// no upload directory: acknowledge the posted body
		let mut response = Response::new();
		response.set_header("Content-Type", "text/plain");
		response.set_body(b"ok");
		response.set_complete(true);
		response
	}

	fn handle_put(&self, server: &ServerBlock, location: Option<&Location>) -> Response {
		if location.is_none() {
			return self.error_response_for(server, HTTP_NOT_IMPLEMENTED);
		}
		let full_path = match self.map_path(server, location) {
			Ok(full_path) => full_path,
			Err(response) => return response,
		};

		match fsutil::write_file(&full_path, self.request.body()) {
			Ok(_) => {
				let mut response = Response::with_status(HTTP_CREATED);
				response.set_header("Content-Type", "text/plain");
				response.set_body(b"File created successfully");
				response.set_complete(true);
				response
			}
			Err(e) => {
				error!("PUT to {} failed: {}", full_path, e.kind());
				self.error_response_for(server, HTTP_INTERNAL_SERVER_ERROR)
			}
		}
	}

	fn handle_delete(&self, server: &ServerBlock, location: Option<&Location>) -> Response {
		let full_path = match self.map_path(server, location) {
			Ok(full_path) => full_path,
			Err(response) => return response,
		};

		if !fsutil::file_exists(&full_path) {
			return self.error_response_for(server, HTTP_NOT_FOUND);
		}
		match std::fs::remove_file(&full_path) {
			Ok(_) => {
				let mut response = Response::with_status(HTTP_NO_CONTENT);
				response.set_complete(true);
				response
			}
			Err(e) => {
				error!("DELETE of {} failed: {}", full_path, e);
				self.error_response_for(server, HTTP_INTERNAL_SERVER_ERROR)
			}
		}
	}

	/// The response pipeline hooks: session cookie issuing, compression and
	/// byte ranges, in that order.
	fn apply_response_hooks(&self, response: &mut Response) {
		self.apply_session(response);
		self.apply_compression(response);
		self.apply_range(response);
	}

	fn apply_session(&self, response: &mut Response) {
		if let Some(cookie_header) = self.request.header("cookie") {
			let cookies = Cookie::parse_cookies(cookie_header);
			if let Some(session_id) = cookies.get(SESSION_COOKIE_NAME) {
				match Session::lookup(session_id) {
					Ok(Some(_)) => return, // live session, nothing to issue
					Ok(None) => {}
					Err(e) => {
						warn!("session lookup failed: {}", e.kind());
						return;
					}
				}
			}
		}
		match Session::create() {
			Ok(session) => {
				debug!("session created: {}", session.session_id());
				response.set_cookie(&session.session_cookie());
			}
			Err(e) => warn!("session create failed: {}", e.kind()),
		}
	}

	fn apply_compression(&self, response: &mut Response) {
		// only static GET/HEAD responses; CGI and upload bodies stay as-is
		if self.request.method() != "GET" && self.request.method() != "HEAD" {
			return;
		}
		let accept_encoding = match self.request.header("accept-encoding") {
			Some(accept_encoding) => accept_encoding.to_string(),
			None => return,
		};
		if response.has_header("Content-Encoding") {
			return;
		}
		let content_type = response.header("Content-Type").unwrap_or("").to_string();
		if !compression::should_compress(&content_type, response.body().len()) {
			return;
		}
		let compression_type = CompressionType::accepted(&accept_encoding);
		if compression_type == CompressionType::None {
			return;
		}
		match compression_type.compress(response.body()) {
			Ok(compressed) => {
				response.set_body(&compressed);
				response
					.set_header("Content-Encoding", compression_type.encoding_header());
				debug!("applied {} compression", compression_type.encoding_header());
			}
			Err(e) => warn!("compression failed: {}", e.kind()),
		}
	}

	fn apply_range(&self, response: &mut Response) {
		if self.request.method() != "GET" || response.status_code() != 200 {
			return;
		}
		let range_header = match self.request.header("range") {
			Some(range_header) => range_header.to_string(),
			None => return,
		};
		if response.body().is_empty() {
			return;
		}
		let range = match Range::parse(&range_header, response.body().len()) {
			Some(range) => range,
			None => return,
		};
		// single ranges only
		if !range.is_single_range() {
			return;
		}
		let byte_range = range.first_range();
		let sliced = range.extract(response.body(), &byte_range).to_vec();
		if sliced.is_empty() {
			return;
		}
		let content_range = range.content_range_header(&byte_range);
		response.set_status(206);
		response.set_body(&sliced);
		response.set_header("Content-Range", &content_range);
		response.set_header("Accept-Ranges", "bytes");
	}

	fn stage_body_chunk(&mut self, max_bytes: usize) -> usize {
		let body = self.request.body();
		if self.cgi_body_offset >= body.len() || self.cgi_stage.len() >= max_bytes {
			return 0;
		}
		let room = max_bytes - self.cgi_stage.len();
		let avail = body.len() - self.cgi_body_offset;
		let chunk = std::cmp::min(room, avail);
		self.cgi_stage
			.extend_from_slice(&body[self.cgi_body_offset..self.cgi_body_offset + chunk]);
		self.cgi_body_offset += chunk;
		chunk
	}

	fn maybe_close_cgi_input(&mut self) {
		if !self.cgi_stage.is_empty() || !self.request.is_complete() {
			return;
		}
		if self.cgi_body_offset >= self.request.body().len() {
			// the whole body has been handed to the child; EOF lets it
			// finish and report its full output
			if let Some(cgi) = &mut self.cgi {
				cgi.close_input();
			}
		}
	}

	/// Stage request body bytes into the bounded write buffer and push them
	/// into the CGI stdin pipe without blocking.
	pub fn handle_cgi_input(&mut self) {
		if self.cgi_input_fd().is_none() {
			return;
		}

		self.stage_body_chunk(CGI_WRITE_BUFFER_LIMIT);

		if self.cgi_stage.is_empty() {
			self.maybe_close_cgi_input();
			return;
		}

		let result = match self.cgi.as_mut() {
			Some(cgi) => cgi.write_to_input(&self.cgi_stage),
			None => return,
		};
		match result {
			Ok(0) => {
				// pipe full, retry on the next POLLOUT
				self.update_last_activity();
			}
			Ok(n) => {
				self.update_last_activity();
				self.cgi_stage.drain(0..n);
				self.cgi_bytes_written += n;
				self.stage_body_chunk(CGI_WRITE_BUFFER_LIMIT);
			}
			Err(e) => {
				error!("error writing to CGI stdin: {}", e.kind());
				if let Some(cgi) = &mut self.cgi {
					cgi.close_input();
				}
				self.cgi_stage.clear();
				return;
			}
		}

		self.maybe_close_cgi_input();
	}

	/// Consume CGI stdout. Until the header/body separator is seen the
	/// output accumulates; afterwards the mode depends on whether the CGI
	/// declared a Content-Length (streaming) or not (deferred until EOF).
	pub fn handle_cgi_output(&mut self) {
		if self.cgi.is_none() {
			return;
		}

		let mut buffer = [0u8; BUFFER_SIZE];
		let read_result = match self.cgi.as_mut() {
			Some(cgi) => cgi.read_from_output(&mut buffer),
			None => return,
		};

		match read_result {
			Ok(PipeRead::Data(n)) => {
				self.update_last_activity();
				if self.state == ClientState::CgiProcessing {
					self.cgi_output.extend_from_slice(&buffer[0..n]);
					self.try_begin_cgi_body();
				} else if self.state == ClientState::CgiStreamingBody {
					if self.cgi_headers_sent {
						match self.cgi_body_remaining {
							Some(remaining) => {
								let to_copy = std::cmp::min(remaining, n);
								self.send_buffer
									.extend_from_slice(&buffer[0..to_copy]);
								let remaining = remaining - to_copy;
								self.cgi_body_remaining = Some(remaining);
								// bytes beyond the declared length are
								// discarded
								if remaining == 0 {
									self.finalize_cgi_response();
								}
							}
							None => {
								self.send_buffer.extend_from_slice(&buffer[0..n])
							}
						}
					} else {
						// deferred mode: buffer until EOF so the final
						// Content-Length is accurate
						self.cgi_output.extend_from_slice(&buffer[0..n]);
					}
				}
			}
			Ok(PipeRead::Eof) => {
				if self.in_cgi_state() {
					self.finalize_cgi_response();
				}
			}
			Ok(PipeRead::WouldBlock) => {}
			Err(e) => {
				error!("error reading CGI stdout: {}", e.kind());
				self.state = ClientState::Error;
			}
		}
	}

	/// Once the CGI header block is complete, pick the output mode. A
	/// declared Content-Length switches to streaming: response headers go
	/// out immediately and body bytes flow straight to the send buffer.
	fn try_begin_cgi_body(&mut self) {
		let (header_end, sep_len) = match find_header_body_separator(&self.cgi_output) {
			Some(found) => found,
			None => return,
		};

		let mut response = Cgi::parse_headers(&self.cgi_output[0..header_end]);
		self.compute_keep_alive();
		response.set_header(
			"Connection",
			if self.keep_alive { "keep-alive" } else { "close" },
		);
		if self.keep_alive {
			response.set_header("Keep-Alive", KEEP_ALIVE_PARAMS);
		}

		let declared = response
			.header("Content-Length")
			.and_then(|v| v.trim().parse::<usize>().ok());

		// a final response is about to be queued; an unsent interim 100
		// must not precede raw body bytes
		self.strip_unsent_100_continue();

		match declared {
			Some(declared) => {
				let first_body = self.cgi_output[header_end + sep_len..].to_vec();
				self.send_buffer.extend_from_slice(&response.to_bytes(false));
				self.response = response;
				self.cgi_headers_sent = true;
				let mut remaining = declared;
				if !first_body.is_empty() {
					let to_copy = std::cmp::min(remaining, first_body.len());
					self.send_buffer.extend_from_slice(&first_body[0..to_copy]);
					remaining -= to_copy;
				}
				self.cgi_body_remaining = Some(remaining);
				self.cgi_output.clear();
				self.state = ClientState::CgiStreamingBody;
				if remaining == 0 {
					// the whole declared body already arrived
					self.finalize_cgi_response();
				}
			}
			None => {
				// deferred: the full output keeps accumulating and is
				// re-framed at EOF
				self.state = ClientState::CgiStreamingBody;
			}
		}
	}

	fn strip_unsent_100_continue(&mut self) {
		while self.send_buffer.starts_with(HTTP_CONTINUE_100) {
			self.send_buffer.drain(0..HTTP_CONTINUE_100.len());
		}
	}

	/// Turn accumulated CGI output and streaming state into a complete
	/// response and release the child. One-shot: latched at both the client
	/// and the CGI so a completion sweep racing with an EOF read cannot
	/// emit a second response.
	pub fn finalize_cgi_response(&mut self) {
		if self.cgi.is_none() || self.cgi_finalized {
			return;
		}
		if self.cgi.as_ref().map(|c| c.is_finalized()).unwrap_or(true) {
			return;
		}
		self.cgi_finalized = true;
		if let Some(cgi) = &mut self.cgi {
			cgi.mark_finalized();
		}

		if self.cgi_headers_sent {
			// streaming already delivered headers and body bytes; emitting
			// another response would duplicate the status block
			self.response.set_complete(true);
			self.cgi = None;
			self.state = ClientState::SendingResponse;
			return;
		}

		// Drain whatever still sits in the stdout pipe. The child exiting
		// and the pipe draining race, so tolerate a couple of EAGAINs
		// before giving up.
		let mut buffer = [0u8; BUFFER_SIZE];
		let mut retries = 0;
		loop {
			let read_result = match self.cgi.as_mut() {
				Some(cgi) => cgi.read_from_output(&mut buffer),
				None => break,
			};
			match read_result {
				Ok(PipeRead::Data(n)) => {
					self.cgi_output.extend_from_slice(&buffer[0..n]);
					retries = 0;
				}
				Ok(PipeRead::Eof) => break,
				Ok(PipeRead::WouldBlock) => {
					if retries >= 3 {
						break;
					}
					retries += 1;
					std::thread::sleep(Duration::from_millis(10));
				}
				Err(e) => {
					warn!("error draining CGI stdout: {}", e.kind());
					break;
				}
			}
		}

		// an unsent interim 100 must not precede the final response
		self.strip_unsent_100_continue();

		let timed_out = self
			.cgi
			.as_ref()
			.map(|c| c.has_timed_out(CGI_IDLE_TIMEOUT_SECS))
			.unwrap_or(false);
		let mut response = if timed_out {
			if let Some(cgi) = &mut self.cgi {
				cgi.terminate();
			}
			Response::error_response(HTTP_REQUEST_TIMEOUT, None)
		} else {
			match find_header_body_separator(&self.cgi_output) {
				None => {
					// no header block at all: the raw output is the body
					let mut response = Response::new();
					response.set_header("Content-Type", "text/plain");
					response.set_body(&self.cgi_output);
					response
				}
				Some((header_end, sep_len)) => {
					let mut response =
						Cgi::parse_headers(&self.cgi_output[0..header_end]);
					let body = &self.cgi_output[header_end + sep_len..];
					if let Some(declared) = response.header("Content-Length") {
						if declared.trim().parse::<usize>() != Ok(body.len()) {
							debug!(
								"CGI Content-Length mismatch: declared={} actual={}",
								declared,
								body.len()
							);
						}
					}
					// the actual body size is authoritative
					response.set_body(body);
					response
				}
			}
		};

		self.compute_keep_alive();
		response.set_header(
			"Connection",
			if self.keep_alive { "keep-alive" } else { "close" },
		);
		if self.keep_alive {
			response.set_header("Keep-Alive", KEEP_ALIVE_PARAMS);
		}
		response.set_complete(true);

		// dropping the instance terminates and reaps the child
		self.cgi = None;
		self.cgi_output.clear();

		let with_body = self.request.method() != "HEAD";
		self.send_buffer
			.extend_from_slice(&response.to_bytes(with_body));
		self.response = response;
		self.state = ClientState::SendingResponse;
	}

	/// The reactor's per-iteration CGI check: finalize when the child has
	/// exited, or when it timed out and the client itself has gone idle.
	pub fn sweep_cgi(&mut self) {
		if !self.in_cgi_state() || self.cgi.is_none() {
			return;
		}
		let (finished, timed_out) = match self.cgi.as_mut() {
			Some(cgi) => (
				cgi.is_finished(),
				cgi.has_timed_out(CGI_IDLE_TIMEOUT_SECS),
			),
			None => return,
		};
		let client_idle = self.has_timed_out(CGI_SWEEP_CLIENT_IDLE_SECS);

		if finished || (timed_out && client_idle) {
			debug!("CGI completion or timeout detected on fd {}", self.fd);
			// pick up any bytes still in the pipe first
			self.handle_cgi_output();

			// the child may exit long before a large upload finishes;
			// finalizing now would close the connection under the client
			if finished && !self.request.is_complete() {
				debug!("deferring CGI finalization, request body still arriving");
				return;
			}

			if self.state != ClientState::Finished && self.state != ClientState::Error {
				self.finalize_cgi_response();
			}
		}
	}

	/// Whether the idle sweep may close this connection. Closing is
	/// suppressed while a request body streams in, while a CGI child is
	/// alive, and while a response is still draining.
	pub fn should_close_idle(&mut self, idle_timeout_secs: u64) -> bool {
		if !self.has_timed_out(idle_timeout_secs) {
			return false;
		}
		if !self.request.is_complete() && self.request.is_streaming_mode() {
			return false;
		}
		if self.in_cgi_state() {
			if let Some(cgi) = &mut self.cgi {
				if cgi.is_running() {
					return false;
				}
			}
		}
		if self.state == ClientState::SendingResponse && !self.send_buffer.is_empty() {
			return false;
		}
		true
	}

	/// Prepare for the next request on a keep-alive connection. The receive
	/// buffer is intentionally NOT cleared: it may already hold bytes of
	/// the next pipelined request.
	pub fn reset(&mut self) {
		self.request.reset();
		self.response.reset();
		self.send_buffer.clear();
		self.cgi = None;
		self.cgi_output.clear();
		self.cgi_stage.clear();
		self.cgi_bytes_written = 0;
		self.cgi_body_offset = 0;
		self.cgi_body_remaining = None;
		self.peer_closed = false;
		self.cgi_headers_sent = false;
		self.sent_100_continue = false;
		self.cgi_finalized = false;
		self.update_last_activity();
	}

	pub fn close(&mut self) {
		if self.fd != -1 {
			let _ = unistd::close(self.fd);
			self.fd = -1;
		}
		self.state = ClientState::Finished;
	}
}

impl Drop for Client {
	fn drop(&mut self) {
		// the CGI field drops with the client and reaps its child
		if self.fd != -1 {
			let _ = unistd::close(self.fd);
			self.fd = -1;
		}
	}
}

fn mime_for(path: &str) -> &'static str {
	match fsutil::file_extension(path) {
		Some(extension) => fsutil::mime_type(extension),
		None => "application/octet-stream",
	}
}

#[cfg(test)]
mod test {
	use crate::client::*;
	use crate::config::Config;
	use std::io::Write;
	use std::os::unix::fs::PermissionsExt;
	use webserv_deps::nix::fcntl::{fcntl, FcntlArg, OFlag};
	use webserv_deps::nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};
	use webserv_err::Error;
	use webserv_log::*;

	debug!();

	struct TestEnv {
		dir: String,
		config: Config,
	}

	impl TestEnv {
		fn new(name: &str, extra_conf: &str) -> Result<Self, Error> {
			let dir = format!(".{}.webserv", name);
			let _ = std::fs::remove_dir_all(&dir);
			std::fs::create_dir_all(format!("{}/www", dir))?;
			let conf_path = format!("{}/test.conf", dir);
			let conf = format!(
				"server {{\n\
				 \tlisten 127.0.0.1:8080;\n\
				 \tserver_name localhost;\n\
				 \troot ./{}/www;\n\
				 \tindex index.html;\n\
				 \tlocation / {{\n\
				 \t\tallow_methods GET POST DELETE PUT;\n\
				 \t}}\n\
				 {}\
				 }}\n",
				dir, extra_conf
			);
			let mut file = std::fs::File::create(&conf_path)?;
			file.write_all(conf.as_bytes())?;
			let config = Config::load(&conf_path)?;
			Ok(Self { dir, config })
		}

		fn write_www(&self, name: &str, content: &[u8]) -> Result<(), Error> {
			std::fs::write(format!("{}/www/{}", self.dir, name), content)?;
			Ok(())
		}
	}

	impl Drop for TestEnv {
		fn drop(&mut self) {
			let _ = std::fs::remove_dir_all(&self.dir);
		}
	}

	fn make_client() -> Result<(Client, RawFd), Error> {
		let (client_fd, peer_fd) = socketpair(
			AddressFamily::Unix,
			SockType::Stream,
			None,
			SockFlag::empty(),
		)?;
		fcntl(client_fd, FcntlArg::F_SETFL(OFlag::O_NONBLOCK))?;
		fcntl(peer_fd, FcntlArg::F_SETFL(OFlag::O_NONBLOCK))?;
		Ok((Client::new(client_fd, 0, "127.0.0.1".to_string()), peer_fd))
	}

	fn peer_write(peer_fd: RawFd, data: &[u8]) {
		let mut written = 0;
		while written < data.len() {
			match send(peer_fd, &data[written..], MsgFlags::empty()) {
				Ok(n) => written += n,
				Err(Errno::EAGAIN) => {
					std::thread::sleep(Duration::from_millis(1))
				}
				Err(e) => panic!("peer write failed: {}", e),
			}
		}
	}

	fn peer_read(peer_fd: RawFd) -> Vec<u8> {
		let mut out = vec![];
		let mut buf = [0u8; 65536];
		for _ in 0..50 {
			match recv(peer_fd, &mut buf, MsgFlags::empty()) {
				Ok(0) => break,
				Ok(n) => out.extend_from_slice(&buf[0..n]),
				Err(Errno::EAGAIN) => {
					if !out.is_empty() {
						break;
					}
					std::thread::sleep(Duration::from_millis(2));
				}
				Err(e) => panic!("peer read failed: {}", e),
			}
		}
		out
	}

	fn roundtrip(client: &mut Client, peer_fd: RawFd, config: &Config, req: &[u8]) -> Vec<u8> {
		peer_write(peer_fd, req);
		client.receive();
		client.process_request(config);
		client.send_data();
		peer_read(peer_fd)
	}

	#[test]
	fn test_static_get() -> Result<(), Error> {
		let env = TestEnv::new("test_static_get", "")?;
		env.write_www("index.html", b"HELLO")?;
		let (mut client, peer_fd) = make_client()?;

		let response = roundtrip(
			&mut client,
			peer_fd,
			&env.config,
			b"GET /index.html HTTP/1.1\r\nHost: x\r\n\r\n",
		);
		let text = String::from_utf8_lossy(&response);
		assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
		assert!(text.contains("Content-Length: 5\r\n"));
		assert!(text.contains("Content-Type: text/html\r\n"));
		assert!(text.ends_with("HELLO"));
		// keep-alive is the HTTP/1.1 default
		assert!(text.contains("Connection: keep-alive\r\n"));
		assert_eq!(client.state(), ClientState::ReceivingRequest);

		let _ = unistd::close(peer_fd);
		Ok(())
	}

	#[test]
	fn test_get_directory_index() -> Result<(), Error> {
		let env = TestEnv::new("test_get_directory_index", "")?;
		env.write_www("index.html", b"<html>home</html>")?;
		let (mut client, peer_fd) = make_client()?;

		let response = roundtrip(
			&mut client,
			peer_fd,
			&env.config,
			b"GET / HTTP/1.1\r\nHost: x\r\n\r\n",
		);
		let text = String::from_utf8_lossy(&response);
		assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
		assert!(text.ends_with("<html>home</html>"));

		let _ = unistd::close(peer_fd);
		Ok(())
	}

	#[test]
	fn test_get_missing_is_404() -> Result<(), Error> {
		let env = TestEnv::new("test_get_missing", "")?;
		let (mut client, peer_fd) = make_client()?;

		let response = roundtrip(
			&mut client,
			peer_fd,
			&env.config,
			b"GET /missing HTTP/1.1\r\nHost: x\r\n\r\n",
		);
		let text = String::from_utf8_lossy(&response);
		assert!(text.starts_with("HTTP/1.1 404 Not Found\r\n"));
		assert!(text.contains("Content-Type: text/html"));
		// the default error page carries the literal status code
		assert!(text.contains("404"));

		let _ = unistd::close(peer_fd);
		Ok(())
	}

	#[test]
	fn test_autoindex() -> Result<(), Error> {
		let env = TestEnv::new(
			"test_autoindex",
			"\tlocation /files {\n\
			 \t\troot ./.test_autoindex.webserv/www/files;\n\
			 \t\tautoindex on;\n\
			 \t}\n",
		)?;
		std::fs::create_dir_all(format!("{}/www/files", env.dir))?;
		std::fs::write(format!("{}/www/files/a.txt", env.dir), b"a")?;
		let (mut client, peer_fd) = make_client()?;

		let response = roundtrip(
			&mut client,
			peer_fd,
			&env.config,
			b"GET /files HTTP/1.1\r\nHost: x\r\n\r\n",
		);
		let text = String::from_utf8_lossy(&response);
		assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
		assert!(text.contains("Index of /files"));
		assert!(text.contains("a.txt"));

		let _ = unistd::close(peer_fd);
		Ok(())
	}

	#[test]
	fn test_head_omits_body() -> Result<(), Error> {
		let env = TestEnv::new("test_head", "")?;
		env.write_www("index.html", b"HELLO")?;
		let (mut client, peer_fd) = make_client()?;

		let response = roundtrip(
			&mut client,
			peer_fd,
			&env.config,
			b"HEAD /index.html HTTP/1.1\r\nHost: x\r\n\r\n",
		);
		let text = String::from_utf8_lossy(&response);
		assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
		assert!(text.contains("Content-Length: 5\r\n"));
		assert!(text.ends_with("\r\n\r\n"));

		let _ = unistd::close(peer_fd);
		Ok(())
	}

	#[test]
	fn test_post_body_limit() -> Result<(), Error> {
		let env = TestEnv::new(
			"test_post_body_limit",
			"\tlocation /post_body {\n\
			 \t\tallow_methods POST;\n\
			 \t\tclient_max_body_size 100;\n\
			 \t}\n",
		)?;
		let (mut client, peer_fd) = make_client()?;

		let response = roundtrip(
			&mut client,
			peer_fd,
			&env.config,
			b"POST /post_body HTTP/1.1\r\nHost: x\r\nContent-Length: 5\r\n\r\nhello",
		);
		let text = String::from_utf8_lossy(&response);
		assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
		assert!(text.contains("Content-Type: text/plain\r\n"));
		assert!(text.ends_with("ok"));

		// one byte over the limit is rejected
		let (mut client, peer_fd2) = make_client()?;
		let mut big = b"POST /post_body HTTP/1.1\r\nHost: x\r\nContent-Length: 101\r\n\r\n"
			.to_vec();
		big.extend_from_slice(&[b'x'; 101]);
		let response = roundtrip(&mut client, peer_fd2, &env.config, &big);
		let text = String::from_utf8_lossy(&response);
		assert!(text.starts_with("HTTP/1.1 413 Payload Too Large\r\n"));

		let _ = unistd::close(peer_fd);
		let _ = unistd::close(peer_fd2);
		Ok(())
	}

	#[test]
	fn test_body_limit_boundary() -> Result<(), Error> {
		let env = TestEnv::new(
			"test_body_limit_boundary",
			"\tlocation /post_body {\n\
			 \t\tallow_methods POST;\n\
			 \t\tclient_max_body_size 5;\n\
			 \t}\n",
		)?;

		// exactly at the limit is accepted
		let (mut client, peer_fd) = make_client()?;
		let response = roundtrip(
			&mut client,
			peer_fd,
			&env.config,
			b"POST /post_body HTTP/1.1\r\nHost: x\r\nContent-Length: 5\r\n\r\nhello",
		);
		assert!(String::from_utf8_lossy(&response).starts_with("HTTP/1.1 200 OK\r\n"));

		let _ = unistd::close(peer_fd);
		Ok(())
	}

	#[test]
	fn test_early_413_drains_body_before_reuse() -> Result<(), Error> {
		let env = TestEnv::new(
			"test_early_413_drain",
			"\tlocation /small {\n\
			 \t\tallow_methods POST;\n\
			 \t\tclient_max_body_size 5;\n\
			 \t}\n",
		)?;
		env.write_www("index.html", b"HELLO")?;
		let (mut client, peer_fd) = make_client()?;

		// headers declare more than the limit; the 413 goes out before the
		// body has arrived
		let response = roundtrip(
			&mut client,
			peer_fd,
			&env.config,
			b"POST /small HTTP/1.1\r\nHost: x\r\nContent-Length: 20\r\n\r\n",
		);
		assert!(String::from_utf8_lossy(&response).starts_with("HTTP/1.1 413"));
		assert_eq!(client.state(), ClientState::SendingResponse);

		// the trailing body drains, then the channel is reusable
		peer_write(peer_fd, b"01234567890123456789");
		client.receive();
		client.process_request(&env.config);
		assert_eq!(client.state(), ClientState::ReceivingRequest);

		let response = roundtrip(
			&mut client,
			peer_fd,
			&env.config,
			b"GET /index.html HTTP/1.1\r\nHost: x\r\n\r\n",
		);
		let text = String::from_utf8_lossy(&response);
		assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
		assert!(text.ends_with("HELLO"));

		let _ = unistd::close(peer_fd);
		Ok(())
	}

	#[test]
	fn test_chunked_upload() -> Result<(), Error> {
		let env = TestEnv::new(
			"test_chunked_upload",
			"\tlocation /upload {\n\
			 \t\tallow_methods POST;\n\
			 \t\tupload_path ./.test_chunked_upload.webserv/uploads;\n\
			 \t}\n",
		)?;
		std::fs::create_dir_all(format!("{}/uploads", env.dir))?;
		let (mut client, peer_fd) = make_client()?;

		let response = roundtrip(
			&mut client,
			peer_fd,
			&env.config,
			b"POST /upload/foo HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: chunked\r\n\r\n\
			  5\r\nhello\r\n0\r\n\r\n",
		);
		let text = String::from_utf8_lossy(&response);
		assert!(text.starts_with("HTTP/1.1 201 Created\r\n"));
		let uploaded = std::fs::read(format!("{}/uploads/foo", env.dir))?;
		assert_eq!(uploaded, b"hello");

		let _ = unistd::close(peer_fd);
		Ok(())
	}

	#[test]
	fn test_delete() -> Result<(), Error> {
		let env = TestEnv::new("test_delete", "")?;
		env.write_www("tmp.txt", b"x")?;
		let (mut client, peer_fd) = make_client()?;

		let response = roundtrip(
			&mut client,
			peer_fd,
			&env.config,
			b"DELETE /tmp.txt HTTP/1.1\r\nHost: x\r\n\r\n",
		);
		let text = String::from_utf8_lossy(&response);
		assert!(text.starts_with("HTTP/1.1 204 No Content\r\n"));
		assert!(!fsutil::file_exists(&format!("{}/www/tmp.txt", env.dir)));

		// deleting it again is a 404; the connection stayed open
		let response = roundtrip(
			&mut client,
			peer_fd,
			&env.config,
			b"DELETE /tmp.txt HTTP/1.1\r\nHost: x\r\n\r\n",
		);
		assert!(String::from_utf8_lossy(&response).starts_with("HTTP/1.1 404"));

		let _ = unistd::close(peer_fd);
		Ok(())
	}

	#[test]
	fn test_put_creates_file() -> Result<(), Error> {
		let env = TestEnv::new("test_put", "")?;
		let (mut client, peer_fd) = make_client()?;

		let response = roundtrip(
			&mut client,
			peer_fd,
			&env.config,
			b"PUT /new.txt HTTP/1.1\r\nHost: x\r\nContent-Length: 4\r\n\r\ndata",
		);
		assert!(String::from_utf8_lossy(&response).starts_with("HTTP/1.1 201 Created\r\n"));
		assert_eq!(std::fs::read(format!("{}/www/new.txt", env.dir))?, b"data");

		let _ = unistd::close(peer_fd);
		Ok(())
	}

	#[test]
	fn test_method_not_allowed() -> Result<(), Error> {
		let env = TestEnv::new(
			"test_method_not_allowed",
			"\tlocation /ro {\n\t\tallow_methods GET;\n\t}\n",
		)?;
		let (mut client, peer_fd) = make_client()?;

		let response = roundtrip(
			&mut client,
			peer_fd,
			&env.config,
			b"DELETE /ro/x HTTP/1.1\r\nHost: x\r\n\r\n",
		);
		let text = String::from_utf8_lossy(&response);
		assert!(text.starts_with("HTTP/1.1 405 Method Not Allowed\r\n"));
		assert!(text.contains("Allow: GET\r\n"));
		// an empty body keeps pipelined parsers aligned
		assert!(text.contains("Content-Length: 0\r\n"));

		let _ = unistd::close(peer_fd);
		Ok(())
	}

	#[test]
	fn test_head_allowed_where_get_is() -> Result<(), Error> {
		let env = TestEnv::new(
			"test_head_allowed",
			"\tlocation /ro {\n\t\tallow_methods GET;\n\t}\n",
		)?;
		std::fs::create_dir_all(format!("{}/www/ro", env.dir))?;
		std::fs::write(format!("{}/www/ro/f.txt", env.dir), b"data")?;
		let (mut client, peer_fd) = make_client()?;

		let response = roundtrip(
			&mut client,
			peer_fd,
			&env.config,
			b"HEAD /ro/f.txt HTTP/1.1\r\nHost: x\r\n\r\n",
		);
		assert!(String::from_utf8_lossy(&response).starts_with("HTTP/1.1 200 OK\r\n"));

		let _ = unistd::close(peer_fd);
		Ok(())
	}

	#[test]
	fn test_bad_request() -> Result<(), Error> {
		let env = TestEnv::new("test_bad_request", "")?;
		let (mut client, peer_fd) = make_client()?;

		let response = roundtrip(
			&mut client,
			peer_fd,
			&env.config,
			b"FROB / HTTP/1.1\r\nHost: x\r\n\r\n",
		);
		assert!(String::from_utf8_lossy(&response).starts_with("HTTP/1.1 400 Bad Request\r\n"));

		let _ = unistd::close(peer_fd);
		Ok(())
	}

	#[test]
	fn test_redirect() -> Result<(), Error> {
		let env = TestEnv::new(
			"test_redirect",
			"\tlocation /old {\n\t\treturn 302 /new;\n\t}\n",
		)?;
		let (mut client, peer_fd) = make_client()?;

		let response = roundtrip(
			&mut client,
			peer_fd,
			&env.config,
			b"GET /old HTTP/1.1\r\nHost: x\r\n\r\n",
		);
		let text = String::from_utf8_lossy(&response);
		assert!(text.starts_with("HTTP/1.1 302 Found\r\n"));
		assert!(text.contains("Location: /new\r\n"));

		let _ = unistd::close(peer_fd);
		Ok(())
	}

	#[test]
	fn test_connection_close_finishes() -> Result<(), Error> {
		let env = TestEnv::new("test_connection_close", "")?;
		env.write_www("index.html", b"HELLO")?;
		let (mut client, peer_fd) = make_client()?;

		let response = roundtrip(
			&mut client,
			peer_fd,
			&env.config,
			b"GET / HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n",
		);
		let text = String::from_utf8_lossy(&response);
		assert!(text.contains("Connection: close\r\n"));
		assert_eq!(client.state(), ClientState::Finished);

		let _ = unistd::close(peer_fd);
		Ok(())
	}

	#[test]
	fn test_pipelined_requests() -> Result<(), Error> {
		let env = TestEnv::new("test_pipelined", "")?;
		env.write_www("a.txt", b"AAA")?;
		env.write_www("b.txt", b"BBB")?;
		let (mut client, peer_fd) = make_client()?;

		// both requests arrive in one burst, the second interleaved with
		// the first body
		peer_write(
			peer_fd,
			b"POST /post HTTP/1.1\r\nHost: x\r\nContent-Length: 3\r\n\r\nxyzGET /b.txt HTTP/1.1\r\nHost: x\r\n\r\n",
		);
		client.receive();
		client.process_request(&env.config);
		client.send_data();
		let first = peer_read(peer_fd);
		assert!(String::from_utf8_lossy(&first).starts_with("HTTP/1.1 200 OK\r\n"));

		// the reset preserved the second request's bytes
		assert_eq!(client.state(), ClientState::ReceivingRequest);
		assert!(client.has_buffered_request_bytes());
		client.process_request(&env.config);
		client.send_data();
		let second = peer_read(peer_fd);
		let text = String::from_utf8_lossy(&second);
		assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
		assert!(text.ends_with("BBB"));

		let _ = unistd::close(peer_fd);
		Ok(())
	}

	fn write_cgi_script(dir: &str, name: &str, content: &str) -> Result<(), Error> {
		let path = format!("{}/www/cgi/{}", dir, name);
		std::fs::create_dir_all(format!("{}/www/cgi", dir))?;
		std::fs::write(&path, content)?;
		let mut perms = std::fs::metadata(&path)?.permissions();
		perms.set_mode(0o755);
		std::fs::set_permissions(&path, perms)?;
		Ok(())
	}

	fn drive_cgi(client: &mut Client, config: &Config) {
		for _ in 0..500 {
			if !client.in_cgi_state() {
				break;
			}
			client.handle_cgi_input();
			client.handle_cgi_output();
			client.sweep_cgi();
			client.process_request(config);
			std::thread::sleep(Duration::from_millis(2));
		}
	}

	#[test]
	fn test_cgi_deferred_mode() -> Result<(), Error> {
		let env = TestEnv::new(
			"test_cgi_deferred",
			"\tlocation /cgi {\n\
			 \t\troot ./.test_cgi_deferred.webserv/www/cgi;\n\
			 \t\tallow_methods GET POST;\n\
			 \t\tcgi_ext cgi;\n\
			 \t}\n",
		)?;
		// echoes stdin with no headers and no declared length
		write_cgi_script(&env.dir, "echo.cgi", "#!/bin/sh\ncat\n")?;
		let (mut client, peer_fd) = make_client()?;

		peer_write(
			peer_fd,
			b"POST /cgi/echo.cgi HTTP/1.1\r\nHost: x\r\nContent-Length: 3\r\n\r\nABC",
		);
		client.receive();
		client.process_request(&env.config);
		assert!(client.in_cgi_state());

		drive_cgi(&mut client, &env.config);
		assert_eq!(client.state(), ClientState::SendingResponse);
		client.send_data();
		let response = peer_read(peer_fd);
		let text = String::from_utf8_lossy(&response);
		// headerless output is framed as text/plain with an accurate length
		assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
		assert!(text.contains("Content-Type: text/plain\r\n"));
		assert!(text.contains("Content-Length: 3\r\n"));
		assert!(text.ends_with("ABC"));

		let _ = unistd::close(peer_fd);
		Ok(())
	}

	#[test]
	fn test_cgi_streaming_mode_caps_declared_length() -> Result<(), Error> {
		let env = TestEnv::new(
			"test_cgi_streaming",
			"\tlocation /cgi {\n\
			 \t\troot ./.test_cgi_streaming.webserv/www/cgi;\n\
			 \t\tallow_methods GET POST;\n\
			 \t\tcgi_ext cgi;\n\
			 \t}\n",
		)?;
		// declares Content-Length 3 but writes extra bytes afterwards
		write_cgi_script(
			&env.dir,
			"over.cgi",
			"#!/bin/sh\n\
			 printf 'Status: 200\\r\\nContent-Type: text/plain\\r\\nContent-Length: 3\\r\\n\\r\\n'\n\
			 printf 'ABCEXTRA'\n",
		)?;
		let (mut client, peer_fd) = make_client()?;

		peer_write(
			peer_fd,
			b"POST /cgi/over.cgi HTTP/1.1\r\nHost: x\r\nContent-Length: 3\r\n\r\nxyz",
		);
		client.receive();
		client.process_request(&env.config);
		assert!(client.in_cgi_state());

		drive_cgi(&mut client, &env.config);
		assert_eq!(client.state(), ClientState::SendingResponse);
		client.send_data();
		let response = peer_read(peer_fd);
		let text = String::from_utf8_lossy(&response);
		assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
		assert!(text.contains("Content-Length: 3\r\n"));
		// exactly the declared number of body bytes, the excess is dropped
		assert!(text.ends_with("\r\n\r\nABC"));

		let _ = unistd::close(peer_fd);
		Ok(())
	}

	#[test]
	fn test_cgi_expect_continue() -> Result<(), Error> {
		let env = TestEnv::new(
			"test_cgi_continue",
			"\tlocation /cgi {\n\
			 \t\troot ./.test_cgi_continue.webserv/www/cgi;\n\
			 \t\tallow_methods GET POST;\n\
			 \t\tcgi_ext cgi;\n\
			 \t}\n",
		)?;
		write_cgi_script(
			&env.dir,
			"echo.cgi",
			"#!/bin/sh\n\
			 printf 'Status: 200\\r\\nContent-Type: text/plain\\r\\nContent-Length: 3\\r\\n\\r\\n'\n\
			 cat\n",
		)?;
		let (mut client, peer_fd) = make_client()?;

		// headers first; the interim response must be queued exactly once
		peer_write(
			peer_fd,
			b"POST /cgi/echo.cgi HTTP/1.1\r\nHost: x\r\nContent-Length: 3\r\nExpect: 100-continue\r\n\r\n",
		);
		client.receive();
		client.process_request(&env.config);
		client.send_data();
		let interim = peer_read(peer_fd);
		assert_eq!(&interim[..], b"HTTP/1.1 100 Continue\r\n\r\n");

		// now the body
		peer_write(peer_fd, b"ABC");
		client.receive();
		client.process_request(&env.config);
		assert!(client.in_cgi_state());

		drive_cgi(&mut client, &env.config);
		client.send_data();
		let response = peer_read(peer_fd);
		let text = String::from_utf8_lossy(&response);
		assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
		assert!(text.contains("Content-Length: 3\r\n"));
		assert!(text.ends_with("\r\n\r\nABC"));

		let _ = unistd::close(peer_fd);
		Ok(())
	}

	#[test]
	fn test_cgi_finalize_is_one_shot() -> Result<(), Error> {
		let env = TestEnv::new(
			"test_cgi_one_shot",
			"\tlocation /cgi {\n\
			 \t\troot ./.test_cgi_one_shot.webserv/www/cgi;\n\
			 \t\tallow_methods GET POST;\n\
			 \t\tcgi_ext cgi;\n\
			 \t}\n",
		)?;
		write_cgi_script(&env.dir, "echo.cgi", "#!/bin/sh\ncat\n")?;
		let (mut client, peer_fd) = make_client()?;

		peer_write(
			peer_fd,
			b"POST /cgi/echo.cgi HTTP/1.1\r\nHost: x\r\nContent-Length: 3\r\n\r\nABC",
		);
		client.receive();
		client.process_request(&env.config);
		drive_cgi(&mut client, &env.config);
		assert_eq!(client.state(), ClientState::SendingResponse);

		// repeated finalization must not append a second response
		let queued = client.send_buffer.len();
		client.finalize_cgi_response();
		client.finalize_cgi_response();
		assert_eq!(client.send_buffer.len(), queued);

		client.send_data();
		let response = peer_read(peer_fd);
		let text = String::from_utf8_lossy(&response);
		assert_eq!(text.matches("HTTP/1.1 200 OK").count(), 1);

		let _ = unistd::close(peer_fd);
		Ok(())
	}

	#[test]
	fn test_range_request() -> Result<(), Error> {
		let env = TestEnv::new("test_range", "")?;
		env.write_www("data.txt", b"0123456789")?;
		let (mut client, peer_fd) = make_client()?;

		let response = roundtrip(
			&mut client,
			peer_fd,
			&env.config,
			b"GET /data.txt HTTP/1.1\r\nHost: x\r\nRange: bytes=2-5\r\n\r\n",
		);
		let text = String::from_utf8_lossy(&response);
		assert!(text.starts_with("HTTP/1.1 206 Partial Content\r\n"));
		assert!(text.contains("Content-Range: bytes 2-5/10\r\n"));
		assert!(text.contains("Content-Length: 4\r\n"));
		assert!(text.contains("Accept-Ranges: bytes\r\n"));
		assert!(text.ends_with("2345"));

		let _ = unistd::close(peer_fd);
		Ok(())
	}

	#[test]
	fn test_compression_applied() -> Result<(), Error> {
		let env = TestEnv::new("test_compression", "")?;
		env.write_www("big.html", "<p>compressible</p>".repeat(200).as_bytes())?;
		let (mut client, peer_fd) = make_client()?;

		let response = roundtrip(
			&mut client,
			peer_fd,
			&env.config,
			b"GET /big.html HTTP/1.1\r\nHost: x\r\nAccept-Encoding: gzip\r\n\r\n",
		);
		let text = String::from_utf8_lossy(&response);
		assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
		assert!(text.contains("Content-Encoding: gzip\r\n"));

		let _ = unistd::close(peer_fd);
		Ok(())
	}

	#[test]
	fn test_session_cookie_issued() -> Result<(), Error> {
		let env = TestEnv::new("test_session_cookie", "")?;
		env.write_www("index.html", b"x")?;
		let (mut client, peer_fd) = make_client()?;

		let response = roundtrip(
			&mut client,
			peer_fd,
			&env.config,
			b"GET / HTTP/1.1\r\nHost: x\r\n\r\n",
		);
		let text = String::from_utf8_lossy(&response);
		assert!(text.contains("Set-Cookie: SESSIONID="));

		let _ = unistd::close(peer_fd);
		Ok(())
	}
}
