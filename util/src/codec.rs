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

use webserv_err::{Error, ErrorKind};

fn hex_digit(c: u8) -> Option<u8> {
	match c {
		b'0'..=b'9' => Some(c - b'0'),
		b'a'..=b'f' => Some(10 + c - b'a'),
		b'A'..=b'F' => Some(10 + c - b'A'),
		_ => None,
	}
}

/// Percent decode a string. `+` folds to space, invalid escapes are passed
/// through unchanged.
pub fn url_decode(s: &str) -> String {
	let bytes = s.as_bytes();
	let mut out = Vec::with_capacity(bytes.len());
	let mut i = 0;
	while i < bytes.len() {
		if bytes[i] == b'%' {
			if i + 2 < bytes.len() {
				match (hex_digit(bytes[i + 1]), hex_digit(bytes[i + 2])) {
					(Some(hi), Some(lo)) => {
						out.push(hi << 4 | lo);
						i += 3;
						continue;
					}
					_ => {}
				}
			}
			out.push(bytes[i]);
			i += 1;
		} else if bytes[i] == b'+' {
			out.push(b' ');
			i += 1;
		} else {
			out.push(bytes[i]);
			i += 1;
		}
	}
	String::from_utf8_lossy(&out).to_string()
}

/// Percent encode a string. Alphanumerics and `-`, `_`, `.`, `~` pass
/// through unchanged.
pub fn url_encode(s: &str) -> String {
	let mut out = String::with_capacity(s.len());
	for b in s.as_bytes() {
		match b {
			b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
				out.push(*b as char)
			}
			_ => out.push_str(&format!("%{:02X}", b)),
		}
	}
	out
}

/// Decode a complete chunked transfer encoded body. Chunk extensions are
/// skipped, trailers are consumed and discarded. Size lines and chunk
/// terminators may end with CRLF or a bare LF.
pub fn dechunk(input: &[u8]) -> Result<Vec<u8>, Error> {
	let mut out = vec![];
	let n = input.len();
	let mut i = 0;
	while i < n {
		let mut size: usize = 0;
		let mut saw_digit = false;
		while i < n {
			if let Some(d) = hex_digit(input[i]) {
				size = size
					.checked_mul(16)
					.and_then(|v| v.checked_add(d as usize))
					.ok_or_else(|| {
						let error: Error =
							ErrorKind::UnexpectedData("chunk size overflow".to_string())
								.into();
						error
					})?;
				saw_digit = true;
				i += 1;
				continue;
			}
			if input[i] == b';' {
				// skip extensions until the end of the line
				while i < n
					&& !(input[i] == b'\r' && i + 1 < n && input[i + 1] == b'\n')
					&& input[i] != b'\n'
				{
					i += 1;
				}
				break;
			}
			if input[i] == b'\r' || input[i] == b'\n' {
				break;
			}
			return Err(ErrorKind::UnexpectedData(format!(
				"illegal byte in chunk size line: {}",
				input[i]
			))
			.into());
		}
		if !saw_digit {
			return Err(ErrorKind::UnexpectedData("missing chunk size".to_string()).into());
		}

		if i + 1 < n && input[i] == b'\r' && input[i + 1] == b'\n' {
			i += 2;
		} else if i < n && input[i] == b'\n' {
			i += 1;
		} else {
			return Err(
				ErrorKind::UnexpectedData("truncated chunk size line".to_string()).into(),
			);
		}

		if size == 0 {
			// consume optional trailers until an empty line
			while i < n {
				let line_start = i;
				while i < n && input[i] != b'\n' {
					i += 1;
				}
				let line_len = if i > line_start && input[i - 1] == b'\r' {
					i - line_start - 1
				} else {
					i - line_start
				};
				if i < n {
					i += 1; // consume LF
				}
				if line_len == 0 {
					break;
				}
			}
			return Ok(out);
		}

		if i + size > n {
			return Err(ErrorKind::UnexpectedData("truncated chunk data".to_string()).into());
		}
		out.extend_from_slice(&input[i..i + size]);
		i += size;

		if i + 1 < n && input[i] == b'\r' && input[i + 1] == b'\n' {
			i += 2;
		} else if i < n && input[i] == b'\n' {
			i += 1;
		} else {
			return Err(
				ErrorKind::UnexpectedData("missing chunk terminator".to_string()).into(),
			);
		}
	}

	Err(ErrorKind::UnexpectedData("missing terminating chunk".to_string()).into())
}

/// Encode a body with the chunked transfer encoding using a single data
/// chunk plus the terminating zero size chunk.
pub fn chunk_encode(input: &[u8]) -> Vec<u8> {
	let mut out = vec![];
	if input.len() > 0 {
		out.extend_from_slice(format!("{:x}\r\n", input.len()).as_bytes());
		out.extend_from_slice(input);
		out.extend_from_slice("\r\n".as_bytes());
	}
	out.extend_from_slice("0\r\n\r\n".as_bytes());
	out
}
