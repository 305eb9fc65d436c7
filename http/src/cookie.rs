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

/// A cookie with its Set-Cookie attributes.
#[derive(Debug, Clone)]
pub struct Cookie {
	name: String,
	value: String,
	domain: String,
	path: String,
	expires: String,
	max_age: Option<u64>,
	secure: bool,
	http_only: bool,
	same_site: String,
}

impl Cookie {
	pub fn new(name: &str, value: &str) -> Self {
		Self {
			name: name.to_string(),
			value: value.to_string(),
			domain: String::new(),
			path: String::new(),
			expires: String::new(),
			max_age: None,
			secure: false,
			http_only: false,
			same_site: String::new(),
		}
	}

	pub fn name(&self) -> &str {
		&self.name
	}

	pub fn value(&self) -> &str {
		&self.value
	}

	pub fn set_domain(&mut self, domain: &str) {
		self.domain = domain.to_string();
	}

	pub fn set_path(&mut self, path: &str) {
		self.path = path.to_string();
	}

	pub fn set_expires(&mut self, expires: &str) {
		self.expires = expires.to_string();
	}

	pub fn set_max_age(&mut self, max_age: u64) {
		self.max_age = Some(max_age);
	}

	pub fn set_secure(&mut self, secure: bool) {
		self.secure = secure;
	}

	pub fn set_http_only(&mut self, http_only: bool) {
		self.http_only = http_only;
	}

	pub fn set_same_site(&mut self, same_site: &str) {
		self.same_site = same_site.to_string();
	}

	pub fn is_valid(&self) -> bool {
		!self.name.is_empty() && !self.value.is_empty()
	}

	/// The Set-Cookie header value for this cookie.
	pub fn to_string(&self) -> String {
		if self.name.is_empty() {
			return String::new();
		}
		let mut out = format!("{}={}", self.name, self.value);
		if !self.domain.is_empty() {
			out += &format!("; Domain={}", self.domain);
		}
		if !self.path.is_empty() {
			out += &format!("; Path={}", self.path);
		}
		if !self.expires.is_empty() {
			out += &format!("; Expires={}", self.expires);
		}
		if let Some(max_age) = self.max_age {
			out += &format!("; Max-Age={}", max_age);
		}
		if self.secure {
			out += "; Secure";
		}
		if self.http_only {
			out += "; HttpOnly";
		}
		if !self.same_site.is_empty() {
			out += &format!("; SameSite={}", self.same_site);
		}
		out
	}

	/// Parse a request `Cookie:` header into name/value pairs.
	pub fn parse_cookies(cookie_header: &str) -> HashMap<String, String> {
		let mut cookies = HashMap::new();
		for part in cookie_header.split(';') {
			let part = part.trim();
			match part.find('=') {
				Some(pos) => {
					let name = part[0..pos].trim();
					let value = part[pos + 1..].trim();
					if !name.is_empty() {
						cookies.insert(name.to_string(), value.to_string());
					}
				}
				None => {}
			}
		}
		cookies
	}
}

#[cfg(test)]
mod test {
	use crate::cookie::*;
	use webserv_err::Error;

	#[test]
	fn test_to_string() -> Result<(), Error> {
		let mut cookie = Cookie::new("SESSIONID", "abc123");
		cookie.set_path("/");
		cookie.set_http_only(true);
		cookie.set_max_age(3600);
		assert_eq!(
			cookie.to_string(),
			"SESSIONID=abc123; Path=/; Max-Age=3600; HttpOnly"
		);
		Ok(())
	}

	#[test]
	fn test_parse_cookies() -> Result<(), Error> {
		let cookies = Cookie::parse_cookies("SESSIONID=abc; theme=dark; flag");
		assert_eq!(cookies.get("SESSIONID"), Some(&"abc".to_string()));
		assert_eq!(cookies.get("theme"), Some(&"dark".to_string()));
		assert_eq!(cookies.get("flag"), None);
		assert_eq!(cookies.len(), 2);
		Ok(())
	}

	#[test]
	fn test_validity() -> Result<(), Error> {
		assert!(Cookie::new("a", "b").is_valid());
		assert!(!Cookie::new("", "b").is_valid());
		assert!(!Cookie::new("a", "").is_valid());
		Ok(())
	}
}
