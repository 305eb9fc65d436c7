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

use crate::lazy_static::lazy_static;
use crate::Log;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// The name of the default logger used by the macros.
pub const DEFAULT_LOG_NAME: &str = "default";

lazy_static! {
	/// This is the static holder of all log objects. Generally this
	/// should not be accessed directly. See [`log`] instead.
	pub static ref STATIC_LOG: Arc<RwLock<HashMap<String, Log>>> = Arc::new(RwLock::new(HashMap::new()));
}

/// Log at the 'fatal' (5) log level. The bare form sets the file-local log
/// level instead. Also see [`trace`], [`debug`], [`info`], [`warn`] and
/// [`error`].
#[macro_export]
macro_rules! fatal {
	() => {
		webserv_log::do_log!(webserv_log::FATAL);
	};
	($a:expr) => {{
		webserv_log::log!(webserv_log::FATAL, $a);
	}};
	($a:expr,$($b:tt)*)=>{{
		webserv_log::log!(webserv_log::FATAL, $a, $($b)*);
	}};
}

/// Log at the 'error' (4) log level. The bare form sets the file-local log
/// level instead.
#[macro_export]
macro_rules! error {
	() => {
		webserv_log::do_log!(webserv_log::ERROR);
	};
	($a:expr) => {{
		webserv_log::log!(webserv_log::ERROR, $a);
	}};
	($a:expr,$($b:tt)*)=>{{
		webserv_log::log!(webserv_log::ERROR, $a, $($b)*);
	}};
}

/// Log at the 'warn' (3) log level. The bare form sets the file-local log
/// level instead.
#[macro_export]
macro_rules! warn {
	() => {
		webserv_log::do_log!(webserv_log::WARN);
	};
	($a:expr) => {{
		webserv_log::log!(webserv_log::WARN, $a);
	}};
	($a:expr,$($b:tt)*)=>{{
		webserv_log::log!(webserv_log::WARN, $a, $($b)*);
	}};
}

/// Log at the 'info' (2) log level. The bare form sets the file-local log
/// level instead.
#[macro_export]
macro_rules! info {
	() => {
		webserv_log::do_log!(webserv_log::INFO);
	};
	($a:expr) => {{
		webserv_log::log!(webserv_log::INFO, $a);
	}};
	($a:expr,$($b:tt)*)=>{{
		webserv_log::log!(webserv_log::INFO, $a, $($b)*);
	}};
}

/// Log at the 'debug' (1) log level. The bare form sets the file-local log
/// level instead.
#[macro_export]
macro_rules! debug {
	() => {
		webserv_log::do_log!(webserv_log::DEBUG);
	};
	($a:expr) => {{
		webserv_log::log!(webserv_log::DEBUG, $a);
	}};
	($a:expr,$($b:tt)*)=>{{
		webserv_log::log!(webserv_log::DEBUG, $a, $($b)*);
	}};
}

/// Log at the 'trace' (0) log level. The bare form sets the file-local log
/// level instead.
#[macro_export]
macro_rules! trace {
	() => {
		webserv_log::do_log!(webserv_log::TRACE);
	};
	($a:expr) => {{
		webserv_log::log!(webserv_log::TRACE, $a);
	}};
	($a:expr,$($b:tt)*)=>{{
		webserv_log::log!(webserv_log::TRACE, $a, $($b)*);
	}};
}

/// The main logging macro. The first parameter is the log level. To avoid
/// specifying the level, see [`trace`], [`debug`], [`info`], [`warn`],
/// [`error`], or [`fatal`].
#[macro_export]
macro_rules! log {
	($level:expr, $a:expr)=>{{
		let static_log = &webserv_log::STATIC_LOG;
		let log_map = static_log.write();
		match log_map {
			Ok(mut log_map) => {
				let log = log_map.get_mut(webserv_log::DEFAULT_LOG_NAME);
				match log {
					Some(log) => {
						webserv_log::do_log!($level, log, $a);
					},
					None => {
						let mut log = webserv_log::Log::new();
						webserv_log::do_log!($level, log, $a);
						log_map.insert(webserv_log::DEFAULT_LOG_NAME.to_string(), log);
					}
				}
			},
			Err(e) => {
				println!(
					"Error: could not log '{}' due to PoisonError: {}",
					format!($a),
					e.to_string()
				);
			},
		}
	}};
	($level:expr, $a:expr,$($b:tt)*)=>{{
		let static_log = &webserv_log::STATIC_LOG;
		let log_map = static_log.write();
		match log_map {
			Ok(mut log_map) => {
				let log = log_map.get_mut(webserv_log::DEFAULT_LOG_NAME);
				match log {
					Some(log) => {
						webserv_log::do_log!($level, log, $a, $($b)*);
					},
					None => {
						let mut log = webserv_log::Log::new();
						webserv_log::do_log!($level, log, $a, $($b)*);
						log_map.insert(webserv_log::DEFAULT_LOG_NAME.to_string(), log);
					}
				}
			},
			Err(e) => {
				println!(
					"Error: could not log '{}' due to PoisonError: {}",
					format!($a, $($b)*),
					e.to_string()
				);
			},
		}
	}};
}

/// Generally, this macro should not be used directly. It is used by the other
/// macros. See [`log`] or [`info`] instead.
#[macro_export]
macro_rules! do_log {
	($level:expr)=>{
		const LOG_LEVEL: i32 = $level;
	};
	($level:expr, $log:expr, $a:expr)=>{{
		// if not configured, use defaults
		if !$log.is_configured() {
			let _ = $log.init(webserv_log::LogConfig::default());
		}
		if $level >= LOG_LEVEL {
			match $log.log_level(&format!($a), $level) {
				Ok(_) => {},
				Err(e) => {
					println!(
						"Logging of '{}' resulted in Error: {}",
						format!($a),
						e.to_string(),
					);
				}
			}
		}
	}};
	($level:expr, $log:expr, $a:expr, $($b:tt)*)=>{{
		// if not configured, use defaults
		if !$log.is_configured() {
			let _ = $log.init(webserv_log::LogConfig::default());
		}
		if $level >= LOG_LEVEL {
			match $log.log_level(&format!($a, $($b)*), $level) {
				Ok(_) => {},
				Err(e) => {
					println!(
						"Logging of '{}' resulted in Error: {}",
						format!($a, $($b)*),
						e.to_string(),
					);
				}
			}
		}
	}};
}

/// Configure the default logger with the specified [`crate::LogConfig`].
#[macro_export]
macro_rules! log_config {
	($config:expr) => {{
		let static_log = &webserv_log::STATIC_LOG;
		let log_map = static_log.write();
		match log_map {
			Ok(mut log_map) => {
				let mut log = webserv_log::Log::new();
				let res = log.init($config);
				log_map.insert(webserv_log::DEFAULT_LOG_NAME.to_string(), log);
				res
			}
			Err(e) => Err(webserv_log::webserv_err::ErrorKind::PoisonError(format!(
				"log_config poison error: {}",
				e
			))
			.into()),
		}
	}};
}
