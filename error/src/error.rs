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

use crate::failure::{Backtrace, Context, Fail};
#[cfg(unix)]
use crate::nix::errno::Errno;
use std::convert::Infallible;
use std::ffi::NulError;
use std::ffi::OsString;
use std::fmt;
use std::fmt::Display;
use std::net::AddrParseError;
use std::num::ParseIntError;
use std::num::TryFromIntError;
use std::str::Utf8Error;

/// Base Error struct which is used throughout this crate and other crates
#[derive(Debug, Fail)]
pub struct Error {
	inner: Context<ErrorKind>,
}

/// Kinds of errors that can occur
#[derive(Clone, Eq, PartialEq, Debug, Fail)]
pub enum ErrorKind {
	/// Application Error
	#[fail(display = "Application Error: {}", _0)]
	ApplicationError(String),
	/// IOError Error
	#[fail(display = "IOError Error: {}", _0)]
	IOError(String),
	/// Internal Error
	#[fail(display = "Internal Error: {}", _0)]
	InternalError(String),
	/// Setup Error
	#[fail(display = "Setup Error: {}", _0)]
	SetupError(String),
	/// Configuration
	#[fail(display = "Configuration Error: {}", _0)]
	Configuration(String),
	/// Log not configured
	#[fail(display = "Log configuration Error: {}", _0)]
	LogConfigurationError(String),
	/// OsString error
	#[fail(display = "OsString Error: {}", _0)]
	OsStringError(String),
	/// Poison error multiple locks
	#[fail(display = "Poison Error: {}", _0)]
	PoisonError(String),
	/// Poll Error
	#[fail(display = "Poll Error: {}", _0)]
	PollError(String),
	/// Connection handle not found in the client table
	#[fail(display = "Connection Handle was not found: {}", _0)]
	HandleNotFoundError(String),
	/// Http parse error
	#[fail(display = "Http Parse Error: {}", _0)]
	HttpParseError(String),
	/// CGI Error
	#[fail(display = "CGI Error: {}", _0)]
	CgiError(String),
	/// Process Error
	#[fail(display = "Process Error: {}", _0)]
	Process(String),
	/// Timeout
	#[fail(display = "Timeout: {}", _0)]
	Timeout(String),
	/// UnexpectedData
	#[fail(display = "Unexpected Data Error: {}", _0)]
	UnexpectedData(String),
	/// ParseIntError
	#[fail(display = "ParseIntError: {}", _0)]
	ParseIntError(String),
	/// AddrParseError
	#[fail(display = "AddrParseError: {}", _0)]
	AddrParseError(String),
	/// Other error
	#[fail(display = "Other error {}", _0)]
	OtherError(String),
}

impl Display for Error {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let cause = match self.cause() {
			Some(c) => format!("{}", c),
			None => String::from("Unknown"),
		};
		let backtrace = match self.backtrace() {
			Some(b) => format!("{}", b),
			None => String::from("Unknown"),
		};
		let output = format!(
			"{} \n Cause: {} \n Backtrace: {}",
			self.inner, cause, backtrace
		);
		Display::fmt(&output, f)
	}
}

impl Error {
	/// get kind
	pub fn kind(&self) -> ErrorKind {
		self.inner.get_context().clone()
	}
	/// get cause
	pub fn cause(&self) -> Option<&dyn Fail> {
		self.inner.cause()
	}
	/// get backtrace
	pub fn backtrace(&self) -> Option<&Backtrace> {
		self.inner.backtrace()
	}
}

impl From<ErrorKind> for Error {
	fn from(kind: ErrorKind) -> Error {
		Error {
			inner: Context::new(kind),
		}
	}
}

impl From<std::io::Error> for Error {
	fn from(e: std::io::Error) -> Error {
		Error {
			inner: Context::new(ErrorKind::IOError(format!("{}", e))),
		}
	}
}

#[cfg(unix)]
impl From<Errno> for Error {
	fn from(e: Errno) -> Error {
		Error {
			inner: Context::new(ErrorKind::IOError(format!("{}", e))),
		}
	}
}

impl From<Utf8Error> for Error {
	fn from(e: Utf8Error) -> Error {
		Error {
			inner: Context::new(ErrorKind::IOError(format!("{}", e))),
		}
	}
}

impl From<OsString> for Error {
	fn from(e: OsString) -> Error {
		Error {
			inner: Context::new(ErrorKind::OsStringError(format!("{:?}", e))),
		}
	}
}

impl From<ParseIntError> for Error {
	fn from(e: ParseIntError) -> Error {
		Error {
			inner: Context::new(ErrorKind::ParseIntError(format!("{}", e))),
		}
	}
}

impl From<crate::failure::Context<ErrorKind>> for Error {
	fn from(e: crate::failure::Context<ErrorKind>) -> Error {
		Error {
			inner: Context::new(ErrorKind::InternalError(format!("InternalError: {}", e))),
		}
	}
}

impl From<std::string::FromUtf8Error> for Error {
	fn from(e: std::string::FromUtf8Error) -> Error {
		Error {
			inner: Context::new(ErrorKind::InternalError(format!("UTF-8 error: {}", e))),
		}
	}
}

impl From<NulError> for Error {
	fn from(e: NulError) -> Error {
		Error {
			inner: Context::new(ErrorKind::InternalError(format!("Nul error: {}", e))),
		}
	}
}

impl From<std::time::SystemTimeError> for Error {
	fn from(e: std::time::SystemTimeError) -> Error {
		Error {
			inner: Context::new(ErrorKind::InternalError(format!(
				"system time error: {}",
				e
			))),
		}
	}
}

impl From<TryFromIntError> for Error {
	fn from(e: TryFromIntError) -> Error {
		Error {
			inner: Context::new(ErrorKind::InternalError(format!("TryFromIntError: {}", e))),
		}
	}
}

impl From<Infallible> for Error {
	fn from(e: Infallible) -> Error {
		Error {
			inner: Context::new(ErrorKind::InternalError(format!("Infallible: {}", e))),
		}
	}
}

impl From<AddrParseError> for Error {
	fn from(e: AddrParseError) -> Error {
		Error {
			inner: Context::new(ErrorKind::AddrParseError(format!(
				"Error parsing address: {}",
				e
			))),
		}
	}
}
