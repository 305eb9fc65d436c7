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

//! Blocking filesystem helpers. These are only ever invoked from the
//! reactor thread and are bounded by local disk latency.

use std::collections::HashMap;
use std::fs::{metadata, read, read_dir, write};
use std::path::Path;
use webserv_deps::lazy_static::lazy_static;
use webserv_deps::path_clean::clean as path_clean;
use webserv_err::Error;
use webserv_util::url_encode;

lazy_static! {
	static ref MIME_MAP: HashMap<&'static str, &'static str> = {
		let mut m = HashMap::new();
		m.insert("html", "text/html");
		m.insert("htm", "text/html");
		m.insert("css", "text/css");
		m.insert("js", "application/javascript");
		m.insert("json", "application/json");
		m.insert("xml", "application/xml");
		m.insert("txt", "text/plain");
		m.insert("png", "image/png");
		m.insert("jpg", "image/jpeg");
		m.insert("jpeg", "image/jpeg");
		m.insert("gif", "image/gif");
		m.insert("svg", "image/svg+xml");
		m.insert("ico", "image/x-icon");
		m.insert("pdf", "application/pdf");
		m.insert("zip", "application/zip");
		m.insert("mp3", "audio/mpeg");
		m.insert("mp4", "video/mp4");
		m.insert("avi", "video/x-msvideo");
		m
	};
}

pub fn file_exists(path: &str) -> bool {
	metadata(path).is_ok()
}

pub fn is_directory(path: &str) -> bool {
	match metadata(path) {
		Ok(md) => md.is_dir(),
		Err(_) => false,
	}
}

pub fn read_file(path: &str) -> Result<Vec<u8>, Error> {
	Ok(read(path)?)
}

pub fn write_file(path: &str, content: &[u8]) -> Result<(), Error> {
	Ok(write(path, content)?)
}

/// The extension of a filename, without the dot. A trailing dot yields None.
pub fn file_extension(name: &str) -> Option<&str> {
	match name.rfind('.') {
		Some(pos) if pos + 1 < name.len() => Some(&name[pos + 1..]),
		_ => None,
	}
}

pub fn mime_type(extension: &str) -> &'static str {
	let extension = extension.to_lowercase();
	match MIME_MAP.get(extension.as_str()) {
		Some(mime) => mime,
		None => "application/octet-stream",
	}
}

/// Normalize a filesystem path, collapsing `.` and `..` segments so a
/// request cannot escape its document root.
pub fn clean_path(path: &str) -> String {
	path_clean(path)
}

/// Sorted entries of a directory, `.` and `..` excluded.
pub fn directory_entries(path: &str) -> Result<Vec<String>, Error> {
	let mut entries = vec![];
	for entry in read_dir(path)? {
		let entry = entry?;
		let name = entry.file_name().to_string_lossy().to_string();
		entries.push(name);
	}
	entries.sort();
	Ok(entries)
}

/// The autoindex page for a directory.
pub fn autoindex_html(path: &str, uri: &str) -> Result<String, Error> {
	let entries = directory_entries(path)?;
	let mut html = String::new();
	html += "<!DOCTYPE html>\n";
	html += &format!("<html><head><title>Index of {}</title></head>\n", uri);
	html += &format!("<body><h1>Index of {}</h1>\n", uri);
	html += "<hr><pre>\n";
	if uri != "/" {
		html += "<a href=\"../\">../</a>\n";
	}
	for entry in &entries {
		let full = Path::new(path).join(entry);
		let is_dir = full.is_dir();
		let mut href = url_encode(entry);
		let mut display = entry.clone();
		if is_dir {
			href += "/";
			display += "/";
		}
		html += &format!("<a href=\"{}\">{}</a>\n", href, display);
	}
	html += "</pre><hr></body></html>\n";
	Ok(html)
}
