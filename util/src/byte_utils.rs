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

const CRLF_CRLF: &[u8] = "\r\n\r\n".as_bytes();
const LF_LF: &[u8] = "\n\n".as_bytes();

pub fn bytes_eq(bytes1: &[u8], bytes2: &[u8]) -> bool {
	let b1_len = bytes1.len();
	let b2_len = bytes2.len();
	if b1_len != b2_len {
		false
	} else {
		let mut ret = true;
		for i in 0..b1_len {
			if bytes1[i] != bytes2[i] {
				ret = false;
				break;
			}
		}

		ret
	}
}

pub fn bytes_find(bytes: &[u8], pattern: &[u8]) -> Option<usize> {
	let pattern_len = pattern.len();
	let bytes_len = bytes.len();
	if pattern_len > bytes_len {
		None
	} else {
		for i in 0..(bytes_len - pattern_len) + 1 {
			let mut is_equal = true;
			for j in 0..pattern_len {
				if bytes[i + j] != pattern[j] {
					is_equal = false;
					break;
				}
			}

			if is_equal {
				return Some(i);
			}
		}
		None
	}
}

pub fn bytes_to_usize(bytes: &[u8]) -> Result<usize, Error> {
	if bytes.len() == 0 {
		return Err(ErrorKind::UnexpectedData("empty number".to_string()).into());
	}
	let mut ret: usize = 0;
	for b in bytes {
		if *b < '0' as u8 || *b > '9' as u8 {
			return Err(ErrorKind::UnexpectedData(format!(
				"Illegal character in number: {}",
				b,
			))
			.into());
		}
		ret = ret
			.checked_mul(10)
			.and_then(|v| v.checked_add((*b - '0' as u8) as usize))
			.ok_or_else(|| {
				let error: Error =
					ErrorKind::UnexpectedData("number overflow".to_string()).into();
				error
			})?;
	}

	Ok(ret)
}

pub fn bytes_to_usize_hex(bytes: &[u8]) -> Result<usize, Error> {
	if bytes.len() == 0 {
		return Err(ErrorKind::UnexpectedData("empty hex number".to_string()).into());
	}
	let mut ret: usize = 0;
	for b in bytes {
		let digit = match *b {
			b'0'..=b'9' => (*b - b'0') as usize,
			b'a'..=b'f' => 10 + (*b - b'a') as usize,
			b'A'..=b'F' => 10 + (*b - b'A') as usize,
			_ => {
				return Err(ErrorKind::UnexpectedData(format!(
					"Illegal character in hex number: {}",
					b,
				))
				.into())
			}
		};
		ret = ret
			.checked_mul(16)
			.and_then(|v| v.checked_add(digit))
			.ok_or_else(|| {
				let error: Error =
					ErrorKind::UnexpectedData("hex number overflow".to_string()).into();
				error
			})?;
	}

	Ok(ret)
}

/// Find the end of an HTTP style header block in a buffer. Both CRLF CRLF and
/// LF LF separators are supported, whichever appears first wins. On success
/// the returned tuple is the index of the first separator byte and the
/// separator length.
pub fn find_header_body_separator(buf: &[u8]) -> Option<(usize, usize)> {
	let crlf = bytes_find(buf, CRLF_CRLF);
	let lf = bytes_find(buf, LF_LF);
	match (crlf, lf) {
		(Some(c), Some(l)) => {
			if c < l {
				Some((c, 4))
			} else {
				Some((l, 2))
			}
		}
		(Some(c), None) => Some((c, 4)),
		(None, Some(l)) => Some((l, 2)),
		(None, None) => None,
	}
}

#[cfg(test)]
mod test {
	use crate::byte_utils::*;
	use webserv_err::Error;

	#[test]
	fn test_bytes_find() -> Result<(), Error> {
		assert!(bytes_find("abc".as_bytes(), "def".as_bytes()).is_none());
		assert_eq!(bytes_find("abc".as_bytes(), "abc".as_bytes()), Some(0));
		assert!(bytes_find("abc".as_bytes(), "abcd".as_bytes()).is_none());
		assert_eq!(bytes_find("abcd".as_bytes(), "abc".as_bytes()), Some(0));
		assert_eq!(bytes_find("abcd".as_bytes(), "bcd".as_bytes()), Some(1));
		assert_eq!(bytes_find("abcde".as_bytes(), "bcd".as_bytes()), Some(1));
		Ok(())
	}

	#[test]
	fn test_bytes_to_usize() -> Result<(), Error> {
		assert_eq!(bytes_to_usize("0".as_bytes())?, 0);
		assert_eq!(bytes_to_usize("123".as_bytes())?, 123);
		assert_eq!(bytes_to_usize("65536".as_bytes())?, 65536);
		assert!(bytes_to_usize("12a".as_bytes()).is_err());
		assert!(bytes_to_usize("".as_bytes()).is_err());
		Ok(())
	}

	#[test]
	fn test_bytes_to_usize_hex() -> Result<(), Error> {
		assert_eq!(bytes_to_usize_hex("0".as_bytes())?, 0);
		assert_eq!(bytes_to_usize_hex("a".as_bytes())?, 10);
		assert_eq!(bytes_to_usize_hex("FF".as_bytes())?, 255);
		assert_eq!(bytes_to_usize_hex("1e20".as_bytes())?, 0x1e20);
		assert!(bytes_to_usize_hex("12g".as_bytes()).is_err());
		assert!(bytes_to_usize_hex("".as_bytes()).is_err());
		Ok(())
	}

	#[test]
	fn test_find_header_body_separator() -> Result<(), Error> {
		assert_eq!(
			find_header_body_separator("abc\r\n\r\ndef".as_bytes()),
			Some((3, 4))
		);
		assert_eq!(
			find_header_body_separator("abc\n\ndef".as_bytes()),
			Some((3, 2))
		);
		// earlier separator wins
		assert_eq!(
			find_header_body_separator("a\n\nbc\r\n\r\n".as_bytes()),
			Some((1, 2))
		);
		assert_eq!(
			find_header_body_separator("a\r\n\r\nbc\n\n".as_bytes()),
			Some((1, 4))
		);
		assert!(find_header_body_separator("abc\r\ndef".as_bytes()).is_none());
		Ok(())
	}
}
