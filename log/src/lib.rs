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

//! Logging crate used by webserv. The macro library logs at the standard
//! five levels plus fatal and allows specifying a log file with size and age
//! based rotation. Each file sets its log level with the bare form of a level
//! macro before logging:
//!
//! ```
//! use webserv_log::*;
//! use webserv_err::Error;
//!
//! debug!();
//!
//! fn test() -> Result<(), Error> {
//!     let value = 1;
//!     info!("This will be logged. Value: {}", value);
//!     Ok(())
//! }
//! ```

use webserv_deps::chrono;
use webserv_deps::colored;
use webserv_deps::lazy_static;
use webserv_deps::rand;

mod logger;
mod macros;

pub use crate::logger::{Log, LogConfig};
pub use crate::logger::{DEBUG, ERROR, FATAL, INFO, TRACE, WARN};
pub use crate::macros::{DEFAULT_LOG_NAME, STATIC_LOG};

#[doc(hidden)]
pub use webserv_err;
