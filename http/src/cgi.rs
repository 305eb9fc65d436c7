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

use crate::fsutil;
use crate::request::Request;
use crate::response::{Response, SERVER_NAME};
use std::collections::HashMap;
use std::ffi::CString;
use std::os::unix::prelude::RawFd;
use std::time::{Duration, Instant};
use webserv_deps::libc;
use webserv_deps::nix::errno::Errno;
use webserv_deps::nix::fcntl::{fcntl, open, FcntlArg, OFlag};
use webserv_deps::nix::sys::signal::{kill, killpg, Signal};
use webserv_deps::nix::sys::stat::Mode;
use webserv_deps::nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use webserv_deps::nix::unistd::{
	close, dup2, execve, fork, pipe, read, setpgid, write, ForkResult, Pid,
};
use webserv_err::{Error, ErrorKind};
use webserv_log::*;

warn!();

/// Result of a non-blocking read from the CGI stdout pipe.
#[derive(Debug, PartialEq)]
pub enum PipeRead {
	Data(usize),
	Eof,
	WouldBlock,
}

/// A CGI/1.1 child process with its two pipe ends. The instance is owned by
/// exactly one client; dropping it terminates and reaps the child so no
/// orphan survives the connection.
pub struct Cgi {
	interpreter: Option<String>,
	cgi_extension: Option<String>,
	script_path: String,
	env: HashMap<String, String>,
	pid: Option<Pid>,
	input_fd: Option<RawFd>,
	output_fd: Option<RawFd>,
	running: bool,
	finalized: bool,
	start_time: Instant,
	last_activity: Instant,
}

impl Cgi {
	pub fn new(interpreter: Option<&str>, cgi_extension: Option<&str>) -> Self {
		Self {
			interpreter: interpreter.map(|i| i.to_string()),
			cgi_extension: cgi_extension.map(|e| e.to_string()),
			script_path: String::new(),
			env: HashMap::new(),
			pid: None,
			input_fd: None,
			output_fd: None,
			running: false,
			finalized: false,
			start_time: Instant::now(),
			last_activity: Instant::now(),
		}
	}

	/// One-shot latch guarding response finalization.
	pub fn is_finalized(&self) -> bool {
		self.finalized
	}

	pub fn mark_finalized(&mut self) {
		self.finalized = true;
	}

	pub fn input_fd(&self) -> Option<RawFd> {
		self.input_fd
	}

	pub fn output_fd(&self) -> Option<RawFd> {
		self.output_fd
	}

	pub fn start_time(&self) -> Instant {
		self.start_time
	}

	pub fn environment(&self) -> &HashMap<String, String> {
		&self.env
	}

	/// Build the CGI/1.1 environment from the request and the connection
	/// context. Every request header is exported as HTTP_<NAME>, except
	/// content-length and content-type which have their own variables. A
	/// chunked request omits CONTENT_LENGTH, the child reads stdin to EOF.
	pub fn setup_environment(
		&mut self,
		request: &Request,
		server_name: &str,
		server_port: u16,
		remote_addr: &str,
	) {
		self.env.clear();
		self.env
			.insert("REQUEST_METHOD".to_string(), request.method().to_string());
		self.env
			.insert("REQUEST_URI".to_string(), request.uri().to_string());
		self.env.insert(
			"QUERY_STRING".to_string(),
			request.query_string().to_string(),
		);
		self.env
			.insert("SERVER_PROTOCOL".to_string(), "HTTP/1.1".to_string());
		self.env
			.insert("GATEWAY_INTERFACE".to_string(), "CGI/1.1".to_string());
		self.env
			.insert("SERVER_SOFTWARE".to_string(), SERVER_NAME.to_string());
		self.env
			.insert("SERVER_NAME".to_string(), server_name.to_string());
		self.env
			.insert("SERVER_PORT".to_string(), format!("{}", server_port));
		self.env
			.insert("REMOTE_ADDR".to_string(), remote_addr.to_string());
		self.env
			.insert("SCRIPT_NAME".to_string(), request.path().to_string());
		self.env
			.insert("PATH_INFO".to_string(), request.path().to_string());
		let script_filename = if self.script_path.is_empty() {
			request.path().to_string()
		} else {
			self.script_path.clone()
		};
		self.env
			.insert("SCRIPT_FILENAME".to_string(), script_filename.clone());
		self.env
			.insert("PATH_TRANSLATED".to_string(), script_filename);
		self.env
			.insert("PATH".to_string(), "/usr/bin:/bin".to_string());
		self.env
			.insert("REDIRECT_STATUS".to_string(), "200".to_string());

		if let Some(content_type) = request.header("content-type") {
			self.env
				.insert("CONTENT_TYPE".to_string(), content_type.to_string());
		}

		if !request.is_chunked() {
			if let Some(content_length) = request.header("content-length") {
				if content_length.parse::<usize>().is_ok() {
					self.env.insert(
						"CONTENT_LENGTH".to_string(),
						content_length.to_string(),
					);
				}
			}
		}

		for (name, value) in request.headers() {
			if name == "content-length" || name == "content-type" {
				continue;
			}
			let name: String = name
				.chars()
				.map(|c| {
					if c == '-' {
						'_'
					} else {
						c.to_ascii_uppercase()
					}
				})
				.collect();
			self.env.insert(format!("HTTP_{}", name), value.clone());
		}
	}

	/// Fork and exec the script with stdin/stdout wired to pipes and stderr
	/// discarded. The parent keeps both pipe ends non-blocking. A GET/HEAD
	/// without a body closes stdin right away so the child sees EOF.
	pub fn execute(
		&mut self,
		request: &Request,
		script_path: &str,
		server_name: &str,
		server_port: u16,
		remote_addr: &str,
	) -> Result<(), Error> {
		self.script_path = absolutize(script_path);

		let extension = fsutil::file_extension(script_path);
		let mapped = match (&self.interpreter, &self.cgi_extension, extension) {
			(Some(_), Some(cgi_extension), Some(extension)) => extension == cgi_extension,
			_ => false,
		};

		if !mapped && !fsutil::file_exists(&self.script_path) {
			return Err(ErrorKind::CgiError(format!(
				"CGI script not found: {}",
				self.script_path
			))
			.into());
		}

		let interpreter = if mapped {
			match &self.interpreter {
				Some(interpreter) => {
					let interpreter = absolutize(interpreter);
					if !fsutil::file_exists(&interpreter) {
						return Err(ErrorKind::CgiError(format!(
							"CGI handler not found: {}",
							interpreter
						))
						.into());
					}
					Some(interpreter)
				}
				None => None,
			}
		} else {
			extension
				.and_then(default_interpreter)
				.map(|i| i.to_string())
		};

		self.setup_environment(request, server_name, server_port, remote_addr);

		let mut argv = vec![];
		match &interpreter {
			Some(interpreter) => {
				argv.push(CString::new(interpreter.as_str())?);
				argv.push(CString::new(self.script_path.as_str())?);
			}
			None => argv.push(CString::new(self.script_path.as_str())?),
		}
		let envp: Vec<CString> = self
			.env
			.iter()
			.map(|(k, v)| CString::new(format!("{}={}", k, v)))
			.collect::<Result<Vec<CString>, _>>()?;

		let (in_read, in_write) = pipe()?;
		let (out_read, out_write) = pipe()?;

		match unsafe { fork() } {
			Ok(ForkResult::Child) => {
				// the child never returns; any failure exits with 127
				let _ = setpgid(Pid::from_raw(0), Pid::from_raw(0));
				let _ = close(in_write);
				let _ = close(out_read);
				let _ = dup2(in_read, libc::STDIN_FILENO);
				let _ = dup2(out_write, libc::STDOUT_FILENO);
				if let Ok(devnull) = open("/dev/null", OFlag::O_WRONLY, Mode::empty()) {
					let _ = dup2(devnull, libc::STDERR_FILENO);
					let _ = close(devnull);
				}
				let _ = execve(&argv[0], &argv, &envp);
				unsafe { libc::_exit(127) };
			}
			Ok(ForkResult::Parent { child }) => {
				// the child is owned from here on; drop reaps it
				self.pid = Some(child);
				self.input_fd = Some(in_write);
				self.output_fd = Some(out_read);
				self.running = true;
				self.start_time = Instant::now();
				self.last_activity = self.start_time;

				let _ = close(in_read);
				let _ = close(out_write);
				fcntl(in_write, FcntlArg::F_SETFL(OFlag::O_NONBLOCK))?;
				fcntl(out_read, FcntlArg::F_SETFL(OFlag::O_NONBLOCK))?;
			}
			Err(e) => {
				let _ = close(in_read);
				let _ = close(in_write);
				let _ = close(out_read);
				let _ = close(out_write);
				return Err(ErrorKind::CgiError(format!("fork() failed: {}", e)).into());
			}
		}

		let has_body = request.content_length() > 0
			|| request.is_chunked()
			|| request.body().len() > 0;
		if !has_body && (request.method() == "GET" || request.method() == "HEAD") {
			self.close_input();
		}

		debug!(
			"CGI execute: pid={:?} script={} mapped={}",
			self.pid, self.script_path, mapped
		);

		Ok(())
	}

	/// Non-blocking write to the child's stdin. Returns the number of bytes
	/// accepted, 0 when the pipe is full.
	pub fn write_to_input(&mut self, data: &[u8]) -> Result<usize, Error> {
		let fd = match self.input_fd {
			Some(fd) => fd,
			None => return Ok(0),
		};
		if data.is_empty() {
			return Ok(0);
		}

		let mut total = 0;
		loop {
			match write(fd, &data[total..]) {
				Ok(n) if n > 0 => {
					total += n;
					self.last_activity = Instant::now();
					if total == data.len() {
						break;
					}
				}
				Ok(_) => break,
				Err(Errno::EAGAIN) => break, // pipe full, retry later
				Err(e) => {
					if total > 0 {
						break;
					}
					return Err(ErrorKind::CgiError(format!(
						"write to CGI stdin failed: {}",
						e
					))
					.into());
				}
			}
		}

		Ok(total)
	}

	/// Non-blocking read from the child's stdout.
	pub fn read_from_output(&mut self, buffer: &mut [u8]) -> Result<PipeRead, Error> {
		let fd = match self.output_fd {
			Some(fd) => fd,
			None => return Ok(PipeRead::Eof),
		};
		match read(fd, buffer) {
			Ok(0) => Ok(PipeRead::Eof),
			Ok(n) => {
				self.last_activity = Instant::now();
				Ok(PipeRead::Data(n))
			}
			Err(Errno::EAGAIN) => Ok(PipeRead::WouldBlock),
			Err(e) => {
				Err(ErrorKind::CgiError(format!("read from CGI stdout failed: {}", e))
					.into())
			}
		}
	}

	/// Close the child's stdin so it sees EOF on its input.
	pub fn close_input(&mut self) {
		if let Some(fd) = self.input_fd.take() {
			let _ = close(fd);
		}
	}

	/// Probe the child with a non-blocking waitpid. A reaped or errored
	/// child clears the running flag.
	pub fn is_running(&mut self) -> bool {
		if !self.running {
			return false;
		}
		let pid = match self.pid {
			Some(pid) => pid,
			None => return false,
		};
		match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
			Ok(WaitStatus::StillAlive) => true,
			Ok(status) => {
				debug!("CGI child {} exited: {:?}", pid, status);
				self.running = false;
				self.pid = None;
				false
			}
			Err(e) => {
				debug!("waitpid on CGI child {} failed: {}", pid, e);
				self.running = false;
				self.pid = None;
				false
			}
		}
	}

	pub fn is_finished(&mut self) -> bool {
		!self.is_running()
	}

	/// Whether the child has been idle longer than the allowed window.
	pub fn has_timed_out(&self, timeout_secs: u64) -> bool {
		if !self.running {
			return false;
		}
		self.last_activity.elapsed().as_secs() > timeout_secs
	}

	/// Terminate the child's process group: SIGTERM, a short grace period,
	/// then SIGKILL, then reap.
	pub fn terminate(&mut self) {
		if let Some(pid) = self.pid.take() {
			if self.running {
				let _ = killpg(pid, Signal::SIGTERM);
				std::thread::sleep(Duration::from_millis(100));
				let _ = killpg(pid, Signal::SIGKILL);
				let _ = kill(pid, Signal::SIGKILL);
				let _ = waitpid(pid, None);
				self.running = false;
			}
		}
		self.close_input();
		if let Some(fd) = self.output_fd.take() {
			let _ = close(fd);
		}
	}

	/// Build a response from a CGI header block. `Status: NNN [text]` sets
	/// the status code, all other lines become headers. Content-Type
	/// defaults to text/plain.
	pub fn parse_headers(headers: &[u8]) -> Response {
		let mut response = Response::new();
		let text = String::from_utf8_lossy(headers);
		let mut has_status = false;

		for line in text.split('\n') {
			let line = line.trim();
			if line.is_empty() {
				continue;
			}
			let colon = match line.find(':') {
				Some(colon) => colon,
				None => continue,
			};
			let name = line[0..colon].trim();
			let value = line[colon + 1..].trim();
			if name.eq_ignore_ascii_case("status") {
				let code: u16 = value
					.split_whitespace()
					.next()
					.unwrap_or("")
					.parse()
					.unwrap_or(200);
				let code = if code < 100 || code > 599 { 200 } else { code };
				response.set_status(code);
				has_status = true;
			} else {
				response.set_header(name, value);
			}
		}

		if !has_status {
			response.set_status(200);
		}
		if !response.has_header("Content-Type") {
			response.set_header("Content-Type", "text/plain");
		}
		response.set_complete(false);
		response
	}
}

impl Drop for Cgi {
	fn drop(&mut self) {
		self.terminate();
	}
}

fn absolutize(path: &str) -> String {
	if path.starts_with('/') {
		return path.to_string();
	}
	match std::env::current_dir() {
		Ok(cwd) => format!("{}/{}", cwd.to_string_lossy(), path.trim_start_matches("./")),
		Err(_) => path.to_string(),
	}
}

fn default_interpreter(extension: &str) -> Option<&'static str> {
	match extension {
		"php" => Some("/usr/bin/php-cgi"),
		"py" => Some("/usr/bin/python3"),
		"pl" => Some("/usr/bin/perl"),
		"rb" => Some("/usr/bin/ruby"),
		_ => None,
	}
}
