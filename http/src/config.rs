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
use std::collections::HashMap;
use std::fs::read_to_string;
use webserv_err::{Error, ErrorKind};
use webserv_log::*;

warn!();

/// Default limit on request bodies (200 mb) when the configuration does not
/// set one.
pub const DEFAULT_MAX_BODY_SIZE: usize = 209_715_200;

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 8080;
const DEFAULT_ROOT: &str = "./www";
const DEFAULT_INDEX: &str = "index.html";

/// Per path-prefix policy attached to a server.
#[derive(Debug, Clone)]
pub struct Location {
	path: String,
	root: String,
	index: String,
	redirect: Option<String>,
	allowed_methods: Vec<String>,
	autoindex: bool,
	upload_path: Option<String>,
	cgi_path: Option<String>,
	cgi_extension: Option<String>,
	max_body_size: usize,
}

impl Location {
	pub fn new(path: &str) -> Self {
		Self {
			path: path.to_string(),
			root: DEFAULT_ROOT.to_string(),
			index: DEFAULT_INDEX.to_string(),
			redirect: None,
			allowed_methods: vec!["GET".to_string()],
			autoindex: false,
			upload_path: None,
			cgi_path: None,
			cgi_extension: None,
			max_body_size: DEFAULT_MAX_BODY_SIZE,
		}
	}

	pub fn path(&self) -> &str {
		&self.path
	}

	pub fn root(&self) -> &str {
		&self.root
	}

	pub fn index(&self) -> &str {
		&self.index
	}

	pub fn redirect(&self) -> Option<&str> {
		self.redirect.as_deref()
	}

	pub fn allowed_methods(&self) -> &Vec<String> {
		&self.allowed_methods
	}

	pub fn autoindex(&self) -> bool {
		self.autoindex
	}

	pub fn upload_path(&self) -> Option<&str> {
		self.upload_path.as_deref()
	}

	pub fn cgi_path(&self) -> Option<&str> {
		self.cgi_path.as_deref()
	}

	pub fn cgi_extension(&self) -> Option<&str> {
		self.cgi_extension.as_deref()
	}

	pub fn max_body_size(&self) -> usize {
		self.max_body_size
	}

	pub fn set_root(&mut self, root: &str) {
		self.root = root.to_string();
	}

	pub fn set_index(&mut self, index: &str) {
		self.index = index.to_string();
	}

	pub fn add_allowed_method(&mut self, method: &str) {
		let method = method.to_uppercase();
		if !self.allowed_methods.contains(&method) {
			self.allowed_methods.push(method);
		}
	}

	/// HEAD is allowed wherever GET is allowed. Centralizing the mapping here
	/// keeps every caller consistent.
	pub fn is_method_allowed(&self, method: &str) -> bool {
		let mut method = method.to_uppercase();
		if method == "HEAD" {
			method = "GET".to_string();
		}
		self.allowed_methods.contains(&method)
	}

	/// Whether this location's path is a prefix of the uri. A match requires
	/// the uri to equal the path, the path to end with '/', or the uri to
	/// continue with '/' right after the prefix.
	pub fn matches(&self, uri: &str) -> bool {
		if self.path == "/" {
			return true;
		}
		if !uri.starts_with(self.path.as_str()) {
			return false;
		}
		uri.len() == self.path.len()
			|| self.path.ends_with('/')
			|| uri.as_bytes()[self.path.len()] == b'/'
	}

	/// Map the request uri to the filesystem by stripping the location path
	/// prefix and joining the remainder to the location root. Example:
	///   location /directory { root ./data; }
	///   uri /directory/file.txt -> ./data/file.txt
	/// For the root location '/', the uri is simply joined to the root.
	pub fn full_path(&self, uri: &str) -> String {
		let mut relative = uri.to_string();

		if self.path != "/" {
			let norm_path = if self.path.len() > 1 && self.path.ends_with('/') {
				&self.path[0..self.path.len() - 1]
			} else {
				&self.path[..]
			};
			if relative.starts_with(norm_path) {
				relative = relative[norm_path.len()..].to_string();
				if relative.is_empty() {
					relative = "/".to_string();
				}
			}
		}

		let mut full_path = self.root.clone();
		if !full_path.ends_with('/') && !relative.starts_with('/') {
			full_path.push('/');
		}
		if relative.starts_with('/') && full_path.ends_with('/') {
			full_path += &relative[1..];
		} else {
			full_path += &relative;
		}
		full_path
	}

	pub fn is_cgi_request(&self, uri: &str) -> bool {
		match &self.cgi_extension {
			Some(cgi_extension) => match fsutil::file_extension(uri) {
				Some(extension) => extension == cgi_extension,
				None => false,
			},
			None => false,
		}
	}
}

/// One `server { .. }` block of the configuration.
#[derive(Debug, Clone)]
pub struct ServerBlock {
	pub host: String,
	pub port: u16,
	pub server_names: Vec<String>,
	pub root: String,
	pub index: String,
	pub max_body_size: usize,
	pub error_pages: HashMap<u16, String>,
	pub locations: Vec<Location>,
}

impl Default for ServerBlock {
	fn default() -> Self {
		Self {
			host: DEFAULT_HOST.to_string(),
			port: DEFAULT_PORT,
			server_names: vec![],
			root: DEFAULT_ROOT.to_string(),
			index: DEFAULT_INDEX.to_string(),
			max_body_size: DEFAULT_MAX_BODY_SIZE,
			error_pages: HashMap::new(),
			locations: vec![],
		}
	}
}

impl ServerBlock {
	/// Longest prefix match among this server's locations.
	pub fn find_location(&self, uri: &str) -> Option<&Location> {
		let mut best_match = None;
		let mut best_match_length = 0;
		for location in &self.locations {
			if location.matches(uri) {
				let path_length = location.path().len();
				if path_length > best_match_length || best_match.is_none() {
					best_match = Some(location);
					best_match_length = path_length;
				}
			}
		}
		best_match
	}

	fn default_location(&self) -> Location {
		let mut location = Location::new("/");
		location.set_root(&self.root);
		location.set_index(&self.index);
		location.add_allowed_method("GET");
		location.add_allowed_method("POST");
		location.add_allowed_method("DELETE");
		location
	}
}

/// Immutable snapshot of the parsed configuration.
#[derive(Debug, Clone)]
pub struct Config {
	servers: Vec<ServerBlock>,
}

impl Default for Config {
	fn default() -> Self {
		let mut server = ServerBlock::default();
		server.server_names.push("localhost".to_string());
		let mut location = server.default_location();
		location.autoindex = true;
		server.locations.push(location);
		Self {
			servers: vec![server],
		}
	}
}

impl Config {
	/// Load a configuration file. A missing file yields the default
	/// configuration, a malformed file is an error.
	pub fn load(file: &str) -> Result<Self, Error> {
		if !fsutil::file_exists(file) {
			warn!(
				"Config file not found: {}, using default configuration",
				file
			);
			return Ok(Self::default());
		}

		let content = read_to_string(file)?;
		let mut servers = vec![];
		let lines: Vec<&str> = content.lines().collect();
		let mut i = 0;
		while i < lines.len() {
			let line = lines[i].trim();
			i += 1;
			if line.is_empty() || line.starts_with('#') {
				continue;
			}
			if line.starts_with("server") && line.contains('{') {
				let server = Self::parse_server_block(&lines, &mut i)?;
				servers.push(server);
			}
		}

		if servers.is_empty() {
			return Err(ErrorKind::Configuration(format!(
				"no server blocks found in {}",
				file
			))
			.into());
		}

		Ok(Self { servers })
	}

	pub fn servers(&self) -> &Vec<ServerBlock> {
		&self.servers
	}

	/// The server block used when no Host based refinement applies.
	pub fn default_server(&self) -> &ServerBlock {
		&self.servers[0]
	}

	/// Select a server block by host/port, refined by server_name.
	pub fn find_server(&self, host: &str, port: u16, server_name: &str) -> Option<&ServerBlock> {
		for server in &self.servers {
			if server.host == host && server.port == port {
				if server_name.is_empty() {
					return Some(server);
				}
				if server
					.server_names
					.iter()
					.any(|name| name == server_name)
				{
					return Some(server);
				}
			}
		}
		for server in &self.servers {
			if server.port == port {
				return Some(server);
			}
		}
		self.servers.first()
	}

	fn parse_server_block(lines: &[&str], i: &mut usize) -> Result<ServerBlock, Error> {
		let mut server = ServerBlock::default();
		let mut brace_count = 1;

		while *i < lines.len() && brace_count > 0 {
			let line = lines[*i].trim().to_string();
			*i += 1;
			if line.is_empty() || line.starts_with('#') {
				continue;
			}

			if line.starts_with("location") {
				let path = Self::parse_location_path(&line)?;
				let mut location = Location::new(&path);
				location.set_root(&server.root);
				Self::parse_location_block(lines, i, &mut location)?;
				server.locations.push(location);
				continue;
			}

			if line.contains('{') {
				brace_count += 1;
			}
			if line.contains('}') {
				brace_count -= 1;
			}
			if brace_count == 0 {
				break;
			}

			let (directive, values) = Self::parse_directive(&line);
			match directive.as_str() {
				"listen" => {
					if let Some(value) = values.first() {
						match value.find(':') {
							Some(pos) => {
								server.host = value[0..pos].to_string();
								server.port = value[pos + 1..].parse()?;
							}
							None => server.port = value.parse()?,
						}
					}
				}
				"server_name" => server.server_names = values,
				"root" => {
					if let Some(value) = values.first() {
						server.root = value.clone();
					}
				}
				"index" => {
					if let Some(value) = values.first() {
						server.index = value.clone();
					}
				}
				"client_max_body_size" => {
					if let Some(value) = values.first() {
						server.max_body_size = Self::parse_size(value)?;
					}
				}
				"error_page" => {
					if values.len() >= 2 {
						let code: u16 = values[0].parse()?;
						server.error_pages.insert(code, values[1].clone());
					}
				}
				_ => debug!("ignoring unknown server directive: {}", directive),
			}
		}

		if server.locations.is_empty() {
			let location = server.default_location();
			server.locations.push(location);
		}

		Ok(server)
	}

	fn parse_location_block(
		lines: &[&str],
		i: &mut usize,
		location: &mut Location,
	) -> Result<(), Error> {
		let mut brace_count = 1;

		while *i < lines.len() && brace_count > 0 {
			let line = lines[*i].trim().to_string();
			*i += 1;
			if line.is_empty() || line.starts_with('#') {
				continue;
			}

			if line.contains('{') {
				brace_count += 1;
			}
			if line.contains('}') {
				brace_count -= 1;
			}
			if brace_count == 0 {
				break;
			}

			let (directive, values) = Self::parse_directive(&line);
			match directive.as_str() {
				"root" => {
					if let Some(value) = values.first() {
						location.root = value.clone();
					}
				}
				"index" => {
					if let Some(value) = values.first() {
						location.index = value.clone();
					}
				}
				"allow_methods" | "methods" => {
					location.allowed_methods =
						values.iter().map(|v| v.to_uppercase()).collect();
				}
				"return" => {
					if values.len() >= 2 {
						location.redirect = Some(values[1].clone());
					}
				}
				"autoindex" => {
					if let Some(value) = values.first() {
						location.autoindex = value == "on" || value == "true";
					}
				}
				"client_max_body_size" => {
					if let Some(value) = values.first() {
						location.max_body_size = Self::parse_size(value)?;
					}
				}
				"upload_path" => {
					if let Some(value) = values.first() {
						location.upload_path = Some(value.clone());
					}
				}
				"cgi_path" => {
					if let Some(value) = values.first() {
						location.cgi_path = Some(value.clone());
					}
				}
				"cgi_ext" | "cgi_extension" => {
					if let Some(value) = values.first() {
						location.cgi_extension =
							Some(value.trim_start_matches('.').to_string());
					}
				}
				_ => debug!("ignoring unknown location directive: {}", directive),
			}
		}

		Ok(())
	}

	fn parse_location_path(line: &str) -> Result<String, Error> {
		let mut tokens = line.split_whitespace();
		tokens.next(); // the 'location' keyword
		match tokens.next() {
			Some(path) if path != "{" => Ok(path.trim_end_matches('{').to_string()),
			_ => Err(ErrorKind::Configuration(format!(
				"location block without a path: '{}'",
				line
			))
			.into()),
		}
	}

	fn parse_directive(line: &str) -> (String, Vec<String>) {
		let line = line.trim_end_matches(';');
		let mut tokens = line.split_whitespace();
		let directive = tokens.next().unwrap_or("").to_string();
		let values = tokens
			.map(|t| t.trim_end_matches(';').to_string())
			.collect();
		(directive, values)
	}

	/// Parse a size directive value. K and M suffixes are accepted in either
	/// case.
	fn parse_size(value: &str) -> Result<usize, Error> {
		let value = value.trim();
		let (number, multiplier) = if value.ends_with('M') || value.ends_with('m') {
			(&value[0..value.len() - 1], 1024 * 1024)
		} else if value.ends_with('K') || value.ends_with('k') {
			(&value[0..value.len() - 1], 1024)
		} else {
			(value, 1)
		};
		let number: usize = number.parse()?;
		Ok(number * multiplier)
	}
}

#[cfg(test)]
mod test {
	use crate::config::*;
	use std::fs::File;
	use std::io::Write;
	use webserv_err::Error;
	use webserv_log::*;

	debug!();

	fn write_config(dir: &str, content: &str) -> Result<String, Error> {
		std::fs::create_dir_all(dir)?;
		let path = format!("{}/test.conf", dir);
		let mut file = File::create(&path)?;
		file.write_all(content.as_bytes())?;
		Ok(path)
	}

	#[test]
	fn test_default_config() -> Result<(), Error> {
		let config = Config::load("/no/such/file.conf")?;
		let server = config.default_server();
		assert_eq!(server.host, "127.0.0.1");
		assert_eq!(server.port, 8080);
		assert_eq!(server.root, "./www");
		assert_eq!(server.index, "index.html");
		assert_eq!(server.locations.len(), 1);
		let location = &server.locations[0];
		assert!(location.is_method_allowed("GET"));
		assert!(location.is_method_allowed("POST"));
		assert!(location.is_method_allowed("DELETE"));
		assert!(!location.is_method_allowed("PUT"));
		assert!(location.autoindex());
		Ok(())
	}

	#[test]
	fn test_parse_config() -> Result<(), Error> {
		let dir = ".test_parse_config.webserv";
		let path = write_config(
			dir,
			"# comment\n\
			 server {\n\
			 \tlisten 0.0.0.0:8085;\n\
			 \tserver_name example.com www.example.com;\n\
			 \troot ./site;\n\
			 \tindex home.html;\n\
			 \tclient_max_body_size 10M;\n\
			 \terror_page 404 ./site/404.html;\n\
			 \tlocation /upload {\n\
			 \t\tallow_methods POST DELETE;\n\
			 \t\tupload_path ./uploads;\n\
			 \t\tclient_max_body_size 200K;\n\
			 \t}\n\
			 \tlocation /cgi-bin {\n\
			 \t\tmethods GET POST;\n\
			 \t\tcgi_path /usr/bin/python3;\n\
			 \t\tcgi_ext .py;\n\
			 \t}\n\
			 \tlocation /old {\n\
			 \t\treturn 302 /new;\n\
			 \t}\n\
			 }\n",
		)?;

		let config = Config::load(&path)?;
		let server = config.default_server();
		assert_eq!(server.host, "0.0.0.0");
		assert_eq!(server.port, 8085);
		assert_eq!(
			server.server_names,
			vec!["example.com".to_string(), "www.example.com".to_string()]
		);
		assert_eq!(server.root, "./site");
		assert_eq!(server.index, "home.html");
		assert_eq!(server.max_body_size, 10 * 1024 * 1024);
		assert_eq!(
			server.error_pages.get(&404),
			Some(&"./site/404.html".to_string())
		);
		assert_eq!(server.locations.len(), 3);

		let upload = server.find_location("/upload/foo").unwrap();
		assert_eq!(upload.path(), "/upload");
		assert_eq!(upload.upload_path(), Some("./uploads"));
		assert_eq!(upload.max_body_size(), 200 * 1024);
		assert!(upload.is_method_allowed("POST"));
		assert!(!upload.is_method_allowed("GET"));

		let cgi = server.find_location("/cgi-bin/test.py").unwrap();
		assert_eq!(cgi.cgi_path(), Some("/usr/bin/python3"));
		assert_eq!(cgi.cgi_extension(), Some("py"));
		assert!(cgi.is_cgi_request("/cgi-bin/test.py"));
		assert!(!cgi.is_cgi_request("/cgi-bin/test.txt"));

		let old = server.find_location("/old").unwrap();
		assert_eq!(old.redirect(), Some("/new"));

		std::fs::remove_dir_all(dir)?;
		Ok(())
	}

	#[test]
	fn test_location_matching() -> Result<(), Error> {
		let mut server = ServerBlock::default();
		server.locations.push(Location::new("/"));
		server.locations.push(Location::new("/dir"));
		server.locations.push(Location::new("/dir/sub"));

		// longest prefix wins
		assert_eq!(server.find_location("/dir/sub/x").unwrap().path(), "/dir/sub");
		assert_eq!(server.find_location("/dir/x").unwrap().path(), "/dir");
		assert_eq!(server.find_location("/dir").unwrap().path(), "/dir");
		// prefix must end on a path boundary
		assert_eq!(server.find_location("/directory").unwrap().path(), "/");
		assert_eq!(server.find_location("/other").unwrap().path(), "/");
		Ok(())
	}

	#[test]
	fn test_full_path() -> Result<(), Error> {
		let mut location = Location::new("/directory");
		location.set_root("./data");
		assert_eq!(location.full_path("/directory/file.txt"), "./data/file.txt");
		assert_eq!(location.full_path("/directory"), "./data/");

		let mut root_location = Location::new("/");
		root_location.set_root("./www");
		assert_eq!(root_location.full_path("/index.html"), "./www/index.html");

		let mut trailing = Location::new("/directory");
		trailing.set_root("./data/");
		assert_eq!(trailing.full_path("/directory/x"), "./data/x");
		Ok(())
	}

	#[test]
	fn test_parse_size() -> Result<(), Error> {
		assert_eq!(Config::parse_size("100")?, 100);
		assert_eq!(Config::parse_size("100K")?, 100 * 1024);
		assert_eq!(Config::parse_size("100k")?, 100 * 1024);
		assert_eq!(Config::parse_size("2M")?, 2 * 1024 * 1024);
		assert!(Config::parse_size("abc").is_err());
		Ok(())
	}
}
