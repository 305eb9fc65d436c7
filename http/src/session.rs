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
use std::collections::HashMap;
use std::time::Instant;
use webserv_deps::lazy_static::lazy_static;
use webserv_deps::rand::{self, Rng};
use webserv_err::Error;
use webserv_util::{lockr, lockw};

/// Session lifetime in seconds.
const SESSION_MAX_AGE_SECS: u64 = 3600;

/// The cookie under which the session id travels.
pub const SESSION_COOKIE_NAME: &str = "SESSIONID";

lazy_static! {
	// in-memory only; sessions do not survive a restart
	static ref SESSIONS: std::sync::Arc<std::sync::RwLock<HashMap<String, Session>>> =
		std::sync::Arc::new(std::sync::RwLock::new(HashMap::new()));
}

/// An in-memory session: a string map plus lifecycle timestamps.
#[derive(Debug, Clone)]
pub struct Session {
	session_id: String,
	data: HashMap<String, String>,
	created_at: Instant,
	last_accessed: Instant,
	max_age_secs: u64,
}

impl Session {
	fn new(session_id: &str) -> Self {
		Self {
			session_id: session_id.to_string(),
			data: HashMap::new(),
			created_at: Instant::now(),
			last_accessed: Instant::now(),
			max_age_secs: SESSION_MAX_AGE_SECS,
		}
	}

	pub fn session_id(&self) -> &str {
		&self.session_id
	}

	pub fn set(&mut self, key: &str, value: &str) {
		self.data.insert(key.to_string(), value.to_string());
		self.touch();
	}

	pub fn get(&self, key: &str) -> Option<&str> {
		self.data.get(key).map(|v| v.as_str())
	}

	pub fn remove(&mut self, key: &str) {
		self.data.remove(key);
		self.touch();
	}

	pub fn touch(&mut self) {
		self.last_accessed = Instant::now();
	}

	pub fn is_expired(&self) -> bool {
		self.last_accessed.elapsed().as_secs() > self.max_age_secs
	}

	pub fn age_secs(&self) -> u64 {
		self.created_at.elapsed().as_secs()
	}

	/// The Set-Cookie value carrying this session's id.
	pub fn session_cookie(&self) -> Cookie {
		let mut cookie = Cookie::new(SESSION_COOKIE_NAME, &self.session_id);
		cookie.set_path("/");
		cookie.set_http_only(true);
		cookie.set_max_age(self.max_age_secs);
		cookie
	}

	/// Look up a session by id, refreshing its last-accessed time. Returns a
	/// clone of the stored session.
	pub fn lookup(session_id: &str) -> Result<Option<Session>, Error> {
		let mut sessions = lockw!(SESSIONS)?;
		match sessions.get_mut(session_id) {
			Some(session) => {
				if session.is_expired() {
					sessions.remove(session_id);
					return Ok(None);
				}
				session.touch();
				Ok(Some(session.clone()))
			}
			None => Ok(None),
		}
	}

	/// Create a new session and register it in the store.
	pub fn create() -> Result<Session, Error> {
		let session_id = Self::generate_session_id();
		let session = Session::new(&session_id);
		let mut sessions = lockw!(SESSIONS)?;
		sessions.insert(session_id, session.clone());
		Ok(session)
	}

	pub fn destroy(session_id: &str) -> Result<(), Error> {
		let mut sessions = lockw!(SESSIONS)?;
		sessions.remove(session_id);
		Ok(())
	}

	/// Drop every expired session from the store.
	pub fn cleanup_expired() -> Result<usize, Error> {
		let mut sessions = lockw!(SESSIONS)?;
		let before = sessions.len();
		sessions.retain(|_, session| !session.is_expired());
		Ok(before - sessions.len())
	}

	pub fn count() -> Result<usize, Error> {
		let sessions = lockr!(SESSIONS)?;
		Ok(sessions.len())
	}

	fn generate_session_id() -> String {
		const CHARS: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
		let mut rng = rand::thread_rng();
		(0..32)
			.map(|_| CHARS[rng.gen_range(0..CHARS.len())] as char)
			.collect()
	}
}

#[cfg(test)]
mod test {
	use crate::session::*;
	use webserv_err::Error;

	#[test]
	fn test_session_lifecycle() -> Result<(), Error> {
		let session = Session::create()?;
		assert_eq!(session.session_id().len(), 32);

		let found = Session::lookup(session.session_id())?;
		assert!(found.is_some());

		Session::destroy(session.session_id())?;
		assert!(Session::lookup(session.session_id())?.is_none());
		Ok(())
	}

	#[test]
	fn test_session_data() -> Result<(), Error> {
		let mut session = Session::create()?;
		session.set("user", "alice");
		assert_eq!(session.get("user"), Some("alice"));
		session.remove("user");
		assert_eq!(session.get("user"), None);
		Session::destroy(session.session_id())?;
		Ok(())
	}

	#[test]
	fn test_session_cookie() -> Result<(), Error> {
		let session = Session::create()?;
		let cookie = session.session_cookie();
		assert_eq!(cookie.name(), SESSION_COOKIE_NAME);
		assert_eq!(cookie.value(), session.session_id());
		assert!(cookie.to_string().contains("HttpOnly"));
		Session::destroy(session.session_id())?;
		Ok(())
	}

	#[test]
	fn test_unique_ids() -> Result<(), Error> {
		let a = Session::create()?;
		let b = Session::create()?;
		assert_ne!(a.session_id(), b.session_id());
		Session::destroy(a.session_id())?;
		Session::destroy(b.session_id())?;
		Ok(())
	}
}
