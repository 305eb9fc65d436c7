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

/// One byte range, inclusive on both ends.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ByteRange {
	pub start: usize,
	pub end: usize,
}

/// A parsed `Range: bytes=` header. Multi-range requests are parsed but only
/// single ranges are applied by the response pipeline.
#[derive(Debug, Clone)]
pub struct Range {
	ranges: Vec<ByteRange>,
	content_length: usize,
}

impl Range {
	/// Parse a Range header against a body of the given length. Returns None
	/// when the header is not a satisfiable bytes range.
	pub fn parse(range_header: &str, content_length: usize) -> Option<Self> {
		if content_length == 0 || !range_header.starts_with("bytes=") {
			return None;
		}

		let mut ranges = vec![];
		for spec in range_header["bytes=".len()..].split(',') {
			let spec = spec.trim();
			let dash = match spec.find('-') {
				Some(dash) => dash,
				None => continue,
			};
			let start_str = &spec[0..dash];
			let end_str = &spec[dash + 1..];

			if start_str.is_empty() && !end_str.is_empty() {
				// suffix range: the last N bytes
				let suffix: usize = match end_str.parse() {
					Ok(suffix) => suffix,
					Err(_) => continue,
				};
				if suffix > 0 && suffix <= content_length {
					ranges.push(ByteRange {
						start: content_length - suffix,
						end: content_length - 1,
					});
				}
			} else if !start_str.is_empty() && end_str.is_empty() {
				// open range: from start to the end of the body
				let start: usize = match start_str.parse() {
					Ok(start) => start,
					Err(_) => continue,
				};
				if start < content_length {
					ranges.push(ByteRange {
						start,
						end: content_length - 1,
					});
				}
			} else if !start_str.is_empty() && !end_str.is_empty() {
				let start: usize = match start_str.parse() {
					Ok(start) => start,
					Err(_) => continue,
				};
				let end: usize = match end_str.parse() {
					Ok(end) => end,
					Err(_) => continue,
				};
				if start <= end && start < content_length {
					ranges.push(ByteRange {
						start,
						end: std::cmp::min(end, content_length - 1),
					});
				}
			}
		}

		if ranges.is_empty() {
			None
		} else {
			Some(Self {
				ranges,
				content_length,
			})
		}
	}

	pub fn is_single_range(&self) -> bool {
		self.ranges.len() == 1
	}

	pub fn ranges(&self) -> &Vec<ByteRange> {
		&self.ranges
	}

	pub fn first_range(&self) -> ByteRange {
		self.ranges[0]
	}

	/// The slice of the body covered by a range.
	pub fn extract<'a>(&self, content: &'a [u8], range: &ByteRange) -> &'a [u8] {
		if range.start >= content.len() {
			return &[];
		}
		let end = std::cmp::min(range.end, content.len() - 1);
		&content[range.start..end + 1]
	}

	/// The Content-Range header value for a range.
	pub fn content_range_header(&self, range: &ByteRange) -> String {
		format!("bytes {}-{}/{}", range.start, range.end, self.content_length)
	}
}

#[cfg(test)]
mod test {
	use crate::range::*;
	use webserv_err::Error;

	#[test]
	fn test_parse_complete_range() -> Result<(), Error> {
		let range = Range::parse("bytes=0-4", 10).unwrap();
		assert!(range.is_single_range());
		assert_eq!(range.first_range(), ByteRange { start: 0, end: 4 });
		assert_eq!(range.content_range_header(&range.first_range()), "bytes 0-4/10");
		Ok(())
	}

	#[test]
	fn test_parse_open_and_suffix() -> Result<(), Error> {
		let range = Range::parse("bytes=5-", 10).unwrap();
		assert_eq!(range.first_range(), ByteRange { start: 5, end: 9 });

		let range = Range::parse("bytes=-3", 10).unwrap();
		assert_eq!(range.first_range(), ByteRange { start: 7, end: 9 });
		Ok(())
	}

	#[test]
	fn test_end_clamped_to_length() -> Result<(), Error> {
		let range = Range::parse("bytes=5-100", 10).unwrap();
		assert_eq!(range.first_range(), ByteRange { start: 5, end: 9 });
		Ok(())
	}

	#[test]
	fn test_invalid_ranges() -> Result<(), Error> {
		assert!(Range::parse("bytes=20-30", 10).is_none());
		assert!(Range::parse("bytes=5-2", 10).is_none());
		assert!(Range::parse("lines=0-2", 10).is_none());
		assert!(Range::parse("bytes=0-4", 0).is_none());
		assert!(Range::parse("bytes=-0", 10).is_none());
		Ok(())
	}

	#[test]
	fn test_multi_range_parsed() -> Result<(), Error> {
		let range = Range::parse("bytes=0-2, 5-7", 10).unwrap();
		assert!(!range.is_single_range());
		assert_eq!(range.ranges().len(), 2);
		Ok(())
	}

	#[test]
	fn test_extract() -> Result<(), Error> {
		let content = b"0123456789";
		let range = Range::parse("bytes=2-5", content.len()).unwrap();
		let extracted = range.extract(content, &range.first_range());
		assert_eq!(extracted, b"2345");
		Ok(())
	}
}
