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

use crate::client::{Client, ClientState};
use crate::config::Config;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::os::unix::prelude::RawFd;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use webserv_deps::libc;
use webserv_deps::nix::errno::Errno;
use webserv_deps::nix::fcntl::{fcntl, FcntlArg, OFlag};
use webserv_deps::nix::poll::{poll, PollFd, PollFlags};
use webserv_deps::nix::sys::signal::{signal, SigHandler, Signal};
use webserv_deps::nix::sys::socket::{
	accept, bind, getpeername, listen, setsockopt, socket, sockopt, AddressFamily, InetAddr,
	SockAddr, SockFlag, SockType,
};
use webserv_deps::nix::unistd::close;
use webserv_err::{Error, ErrorKind};
use webserv_log::*;

info!();

const MAX_CLIENTS: usize = 1024;
const POLL_TIMEOUT_MS: i32 = 100;
const SOCKET_BUFFER_SIZE: usize = 262_144;
const IDLE_TIMEOUT_SECS: u64 = 600;

static RUNNING: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_shutdown_signal(_signal: libc::c_int) {
	// nothing beyond the flag flip may happen in signal context
	RUNNING.store(false, Ordering::SeqCst);
}

// What a pollfd slot stands for. CGI pipe slots carry the owning client's
// socket fd.
#[derive(Clone, Copy)]
enum FdRole {
	Listener(usize),
	ClientSocket(RawFd),
	CgiInput(RawFd),
	CgiOutput(RawFd),
}

/// The reactor: one poll(2) loop multiplexing every listening socket, every
/// client socket and every CGI pipe. Clients live in a table keyed by their
/// socket fd; removing one drops it and transitively its CGI child.
pub struct HttpServer {
	config: Config,
	listeners: Vec<RawFd>,
	clients: HashMap<RawFd, Client>,
}

impl HttpServer {
	pub fn new(config: Config) -> Self {
		Self {
			config,
			listeners: vec![],
			clients: HashMap::new(),
		}
	}

	pub fn config(&self) -> &Config {
		&self.config
	}

	/// Install signal handlers and bind one listening socket per configured
	/// server block.
	pub fn start(&mut self) -> Result<(), Error> {
		info!("starting webserv...");

		unsafe {
			signal(Signal::SIGINT, SigHandler::Handler(handle_shutdown_signal))?;
			signal(Signal::SIGTERM, SigHandler::Handler(handle_shutdown_signal))?;
			signal(Signal::SIGPIPE, SigHandler::SigIgn)?;
		}

		for server in self.config.servers() {
			let fd = Self::create_listener(&server.host, server.port)?;
			self.listeners.push(fd);
			info!("listening on {}:{}", server.host, server.port);
		}

		if self.listeners.is_empty() {
			return Err(
				ErrorKind::SetupError("no listening sockets created".to_string()).into(),
			);
		}

		RUNNING.store(true, Ordering::SeqCst);
		info!("server started successfully");
		Ok(())
	}

	/// Flip the reactor's stop flag; the current loop iteration completes
	/// and the server shuts down.
	pub fn shutdown() {
		RUNNING.store(false, Ordering::SeqCst);
	}

	pub fn is_running() -> bool {
		RUNNING.load(Ordering::SeqCst)
	}

	/// The readiness loop. A short poll timeout lets the timers fire even
	/// on a quiet socket set.
	pub fn run(&mut self) -> Result<(), Error> {
		while RUNNING.load(Ordering::SeqCst) {
			let (mut pollfds, roles) = self.build_pollfds();
			if pollfds.is_empty() {
				std::thread::sleep(std::time::Duration::from_millis(
					POLL_TIMEOUT_MS as u64,
				));
				continue;
			}

			let count = match poll(&mut pollfds, POLL_TIMEOUT_MS) {
				Ok(count) => count,
				Err(Errno::EINTR) => continue,
				Err(e) => {
					error!("poll() failed: {}", e);
					break;
				}
			};

			self.check_cgi_completion();

			if count == 0 {
				self.handle_timeouts();
				continue;
			}

			self.dispatch_events(&pollfds, &roles);
			self.remove_finished();
		}

		self.cleanup();
		Ok(())
	}

	fn create_listener(host: &str, port: u16) -> Result<RawFd, Error> {
		let fd = socket(
			AddressFamily::Inet,
			SockType::Stream,
			SockFlag::empty(),
			None,
		)?;
		match Self::configure_listener(fd, host, port) {
			Ok(_) => Ok(fd),
			Err(e) => {
				let _ = close(fd);
				Err(e)
			}
		}
	}

	fn configure_listener(fd: RawFd, host: &str, port: u16) -> Result<(), Error> {
		setsockopt(fd, sockopt::ReuseAddr, &true)?;
		if let Err(e) = setsockopt(fd, sockopt::RcvBuf, &SOCKET_BUFFER_SIZE) {
			warn!("failed to set SO_RCVBUF: {}", e);
		}
		if let Err(e) = setsockopt(fd, sockopt::SndBuf, &SOCKET_BUFFER_SIZE) {
			warn!("failed to set SO_SNDBUF: {}", e);
		}
		fcntl(fd, FcntlArg::F_SETFL(OFlag::O_NONBLOCK))?;

		let host = if host.is_empty() { "0.0.0.0" } else { host };
		let std_addr = SocketAddr::from_str(&format!("{}:{}", host, port))?;
		let inet_addr = InetAddr::from_std(&std_addr);
		bind(fd, &SockAddr::new_inet(inet_addr))?;
		listen(fd, libc::SOMAXCONN as usize)?;
		Ok(())
	}

	/// Readiness interests for this iteration. A client socket is always
	/// read-interested; write interest is added while a response is being
	/// sent or bytes are queued. CGI pipes are polled only while their
	/// client is in a CGI state.
	fn build_pollfds(&self) -> (Vec<PollFd>, Vec<FdRole>) {
		let mut pollfds = vec![];
		let mut roles = vec![];

		for (i, fd) in self.listeners.iter().enumerate() {
			pollfds.push(PollFd::new(*fd, PollFlags::POLLIN));
			roles.push(FdRole::Listener(i));
		}

		for (fd, client) in &self.clients {
			let mut flags = PollFlags::POLLIN;
			if client.state() == ClientState::SendingResponse || client.has_pending_send()
			{
				flags |= PollFlags::POLLOUT;
			}
			pollfds.push(PollFd::new(*fd, flags));
			roles.push(FdRole::ClientSocket(*fd));

			if client.is_waiting_for_cgi_write() {
				if let Some(cgi_fd) = client.cgi_input_fd() {
					pollfds.push(PollFd::new(cgi_fd, PollFlags::POLLOUT));
					roles.push(FdRole::CgiInput(*fd));
				}
			}
			if client.in_cgi_state() {
				if let Some(cgi_fd) = client.cgi_output_fd() {
					pollfds.push(PollFd::new(cgi_fd, PollFlags::POLLIN));
					roles.push(FdRole::CgiOutput(*fd));
				}
			}
		}

		(pollfds, roles)
	}

	fn dispatch_events(&mut self, pollfds: &[PollFd], roles: &[FdRole]) {
		for i in 0..pollfds.len() {
			let revents = match pollfds[i].revents() {
				Some(revents) => revents,
				None => continue,
			};
			if revents.is_empty() {
				continue;
			}

			match roles[i] {
				FdRole::Listener(index) => {
					if revents.contains(PollFlags::POLLIN) {
						self.accept_connection(index);
					}
				}
				FdRole::ClientSocket(fd) => self.handle_client_socket(fd, revents),
				FdRole::CgiInput(fd) => {
					if revents
						.intersects(PollFlags::POLLOUT | PollFlags::POLLERR)
					{
						if let Some(client) = self.clients.get_mut(&fd) {
							client.handle_cgi_input();
						}
					}
				}
				FdRole::CgiOutput(fd) => {
					// pipe EOF surfaces as POLLHUP on some kernels
					if revents
						.intersects(PollFlags::POLLIN | PollFlags::POLLHUP)
					{
						if let Some(client) = self.clients.get_mut(&fd) {
							client.handle_cgi_output();
						}
					}
				}
			}
		}
	}

	fn handle_client_socket(&mut self, fd: RawFd, revents: PollFlags) {
		let client = match self.clients.get_mut(&fd) {
			Some(client) => client,
			None => return,
		};

		if revents.intersects(PollFlags::POLLHUP | PollFlags::POLLERR) {
			client.mark_peer_closed();
			debug!(
				"HUP/ERR on fd {}, pending send bytes: {}",
				fd,
				client.has_pending_send()
			);
			// best effort flush of anything still queued
			if client.has_pending_send() {
				client.send_data();
			}
			if !client.has_pending_send() {
				client.set_state(ClientState::Finished);
			}
			return;
		}

		// POLLOUT strictly before POLLIN: a completed send resets the
		// client into ReceivingRequest before new bytes are parsed, which
		// keeps pipelined requests aligned.
		if revents.contains(PollFlags::POLLOUT) {
			client.send_data();
			if client.state() == ClientState::ReceivingRequest
				&& client.has_buffered_request_bytes()
			{
				client.process_request(&self.config);
			}
		}
		if revents.contains(PollFlags::POLLIN) {
			client.receive();
			client.process_request(&self.config);
		}
	}

	fn accept_connection(&mut self, listener_index: usize) {
		let listener_fd = self.listeners[listener_index];
		let fd = match accept(listener_fd) {
			Ok(fd) => fd,
			Err(Errno::EAGAIN) => return,
			Err(e) => {
				error!("failed to accept connection: {}", e);
				return;
			}
		};

		if self.clients.len() >= MAX_CLIENTS {
			warn!("maximum clients reached, rejecting connection");
			let _ = close(fd);
			return;
		}

		if let Err(e) = fcntl(fd, FcntlArg::F_SETFL(OFlag::O_NONBLOCK)) {
			error!("failed to set accepted socket non-blocking: {}", e);
			let _ = close(fd);
			return;
		}
		let _ = setsockopt(fd, sockopt::RcvBuf, &SOCKET_BUFFER_SIZE);
		let _ = setsockopt(fd, sockopt::SndBuf, &SOCKET_BUFFER_SIZE);
		if let Err(e) = setsockopt(fd, sockopt::TcpNoDelay, &true) {
			debug!("failed to set TCP_NODELAY: {}", e);
		}

		let remote_addr = match getpeername(fd) {
			Ok(SockAddr::Inet(inet)) => inet.ip().to_string(),
			_ => "unknown".to_string(),
		};
		info!("new connection from {} (fd: {})", remote_addr, fd);

		self.clients
			.insert(fd, Client::new(fd, listener_index, remote_addr));
	}

	/// For every client in a CGI state, finalize when the child exited, or
	/// when it timed out and the client itself has gone idle.
	fn check_cgi_completion(&mut self) {
		for client in self.clients.values_mut() {
			if client.in_cgi_state() {
				client.sweep_cgi();
			}
		}
	}

	/// Close connections whose idle timeout expired. The Client suppresses
	/// the close while a body streams in, a CGI child is alive, or a
	/// response is still draining.
	fn handle_timeouts(&mut self) {
		let mut to_close = vec![];
		for (fd, client) in self.clients.iter_mut() {
			if client.should_close_idle(IDLE_TIMEOUT_SECS) {
				to_close.push(*fd);
			}
		}
		for fd in to_close {
			debug!("client {} timed out", fd);
			self.close_client(fd);
		}
	}

	fn remove_finished(&mut self) {
		let mut to_close = vec![];
		for (fd, client) in &self.clients {
			if client.state() == ClientState::Finished
				|| client.state() == ClientState::Error
			{
				to_close.push(*fd);
			}
		}
		for fd in to_close {
			self.close_client(fd);
		}
	}

	fn close_client(&mut self, fd: RawFd) {
		if let Some(mut client) = self.clients.remove(&fd) {
			debug!(
				"closing client connection (fd: {}, state: {:?})",
				fd,
				client.state()
			);
			client.close();
		}
	}

	fn cleanup(&mut self) {
		info!("stopping server...");
		for (_, mut client) in self.clients.drain() {
			client.close();
		}
		for fd in self.listeners.drain(..) {
			let _ = close(fd);
		}
		info!("server stopped");
	}
}

#[cfg(test)]
mod test {
	use crate::config::Config;
	use crate::server::HttpServer;
	use std::io::{Read, Write};
	use std::net::TcpStream;
	use std::time::Duration;
	use webserv_err::Error;
	use webserv_log::*;

	debug!();

	fn http_request(addr: &str, request: &str) -> Result<String, Error> {
		let mut stream = TcpStream::connect(addr)?;
		stream.set_read_timeout(Some(Duration::from_secs(5)))?;
		stream.write_all(request.as_bytes())?;
		let mut response = String::new();
		stream.read_to_string(&mut response)?;
		Ok(response)
	}

	#[test]
	fn test_server_end_to_end() -> Result<(), Error> {
		let dir = ".test_server_end_to_end.webserv";
		let _ = std::fs::remove_dir_all(dir);
		std::fs::create_dir_all(format!("{}/www", dir))?;
		std::fs::write(format!("{}/www/index.html", dir), b"HELLO")?;
		let conf_path = format!("{}/test.conf", dir);
		std::fs::write(
			&conf_path,
			format!(
				"server {{\n\
				 \tlisten 127.0.0.1:18084;\n\
				 \tserver_name localhost;\n\
				 \troot ./{}/www;\n\
				 \tindex index.html;\n\
				 \tlocation / {{\n\
				 \t\tallow_methods GET POST DELETE;\n\
				 \t}}\n\
				 }}\n",
				dir
			),
		)?;

		let config = Config::load(&conf_path)?;
		let mut server = HttpServer::new(config);
		server.start()?;
		let handle = std::thread::spawn(move || server.run());

		// give the loop a moment to come up
		std::thread::sleep(Duration::from_millis(5000));

		let response = http_request(
			"127.0.0.1:18084",
			"GET /index.html HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
		)?;
		assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
		assert!(response.contains("Content-Length: 5\r\n"));
		assert!(response.ends_with("HELLO"));

		let response = http_request(
			"127.0.0.1:18084",
			"GET /missing HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
		)?;
		assert!(response.starts_with("HTTP/1.1 404 Not Found\r\n"));

		let response = http_request(
			"127.0.0.1:18084",
			"POST /echo HTTP/1.1\r\nHost: localhost\r\nContent-Length: 5\r\nConnection: close\r\n\r\nhello",
		)?;
		assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
		assert!(response.ends_with("ok"));

		// two requests pipelined on one connection
		let mut stream = TcpStream::connect("127.0.0.1:18084")?;
		stream.set_read_timeout(Some(Duration::from_millis(2000)))?;
		stream.write_all(
			b"GET /index.html HTTP/1.1\r\nHost: localhost\r\n\r\n\
			  GET /index.html HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
		)?;
		let mut both = String::new();
		let _ = stream.read_to_string(&mut both);
		assert_eq!(both.matches("HTTP/1.1 200 OK").count(), 2);
		assert_eq!(both.matches("HELLO").count(), 2);

		HttpServer::shutdown();
		let _ = handle.join();
		let _ = std::fs::remove_dir_all(dir);
		Ok(())
	}
}
