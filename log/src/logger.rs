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

use crate::chrono::{DateTime, Local, Utc};
use crate::colored::Colorize;
use crate::rand::random;
use std::convert::TryInto;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::time::Instant;
use webserv_err::{Error, ErrorKind};

/// trace log level (0)
pub const TRACE: i32 = 0;
/// debug log level (1)
pub const DEBUG: i32 = 1;
/// info log level (2)
pub const INFO: i32 = 2;
/// warn log level (3)
pub const WARN: i32 = 3;
/// error log level (4)
pub const ERROR: i32 = 4;
/// fatal log level (5)
pub const FATAL: i32 = 5;

const DISPLAY_ARRAY: [&str; 6] = ["TRACE", "DEBUG", "INFO", "WARN", "ERROR", "FATAL"];

/// The log configuration. All fields have defaults, see [`LogConfig::default`].
#[derive(Debug, Clone)]
pub struct LogConfig {
	/// The path of the log file. If set to None, logging is only done to
	/// standard output.
	pub file_path: Option<String>,
	/// The maximum size in bytes of the log file before a rotation occurs.
	pub max_size: u64,
	/// The maximum age in milliseconds of the log file before a rotation
	/// occurs. A rotated file is renamed to
	/// `<log_name>.r_<month>_<day>_<year>_<time>_<random_number>.log`.
	pub max_age_millis: u128,
	/// Whether or not to show the timestamp.
	pub show_timestamp: bool,
	/// Whether or not to print the log lines to standard output.
	pub show_stdout: bool,
	/// Whether or not to display the log level.
	pub show_log_level: bool,
	/// Whether or not to colorize the log level on standard output.
	pub show_colors: bool,
}

impl Default for LogConfig {
	fn default() -> Self {
		LogConfig {
			file_path: None,
			max_size: 1024 * 1024 * 10,     // 10 mb
			max_age_millis: 60 * 60 * 1000, // 1 hr
			show_timestamp: true,
			show_stdout: true,
			show_log_level: true,
			show_colors: true,
		}
	}
}

struct LogImpl {
	config: LogConfig,
	file: Option<File>,
	cur_size: u64,
	last_rotation: Instant,
}

impl LogImpl {
	fn rotate(&mut self) -> Result<(), Error> {
		let now: DateTime<Utc> = Utc::now();
		let rotation_string = now.format(".r_%m_%d_%Y_%T").to_string().replace(":", "-");
		let original_file_path = match &self.config.file_path {
			Some(file_path) => file_path.clone(),
			None => {
				// not logging to disk. No need to rotate
				return Ok(());
			}
		};
		let base = match original_file_path.rfind(".") {
			Some(pos) => &original_file_path[0..pos],
			_ => &original_file_path[..],
		};
		let new_file_path = format!("{}{}_{}.log", base, rotation_string, random::<u64>());
		std::fs::rename(&original_file_path, new_file_path)?;

		self.file = Some(
			OpenOptions::new()
				.append(true)
				.create(true)
				.open(&original_file_path)?,
		);
		self.cur_size = 0;
		self.last_rotation = Instant::now();

		Ok(())
	}

	fn log(&mut self, line: &str, level: i32) -> Result<(), Error> {
		let age = Instant::now()
			.duration_since(self.last_rotation)
			.as_millis();
		if self.file.is_some() && (self.cur_size >= self.config.max_size || age > self.config.max_age_millis)
		{
			self.rotate()?;
		}

		let level: usize = if level >= 0 && level <= FATAL {
			level.try_into()?
		} else {
			FATAL.try_into()?
		};

		let mut prefix = String::new();
		if self.config.show_timestamp {
			let date = Local::now();
			prefix += &format!("[{}]: ", date.format("%Y-%m-%d %H:%M:%S"));
		}
		if self.config.show_log_level {
			prefix += &format!("({}) ", DISPLAY_ARRAY[level]);
		}

		if let Some(file) = &mut self.file {
			file.write(prefix.as_bytes())?;
			file.write(line.as_bytes())?;
			file.write(&[10u8])?; // newline
			self.cur_size += (prefix.len() + line.len() + 1) as u64;
		}

		if self.config.show_stdout {
			if self.config.show_colors && self.config.show_log_level {
				let mut colored_prefix = String::new();
				if self.config.show_timestamp {
					let date = Local::now();
					colored_prefix +=
						&format!("[{}]: ", date.format("%Y-%m-%d %H:%M:%S"));
				}
				let level_str = DISPLAY_ARRAY[level];
				let level_str = match level {
					0 | 1 => format!("{}", level_str.cyan()),
					2 => format!("{}", level_str.green()),
					3 => format!("{}", level_str.yellow()),
					_ => format!("{}", level_str.red()),
				};
				colored_prefix += &format!("({}) ", level_str);
				println!("{}{}", colored_prefix, line);
			} else {
				println!("{}{}", prefix, line);
			}
		}

		Ok(())
	}
}

/// The main logging object. Generally this is not used directly, the logging
/// macros look it up in the static registry. See [`crate::STATIC_LOG`].
pub struct Log {
	log_impl: Option<LogImpl>,
}

impl Log {
	/// create a new Log object
	pub fn new() -> Log {
		Log { log_impl: None }
	}

	/// whether this log has been configured yet
	pub fn is_configured(&self) -> bool {
		self.log_impl.is_some()
	}

	/// configure this log with the specified [`LogConfig`]
	pub fn init(&mut self, config: LogConfig) -> Result<(), Error> {
		let file = match &config.file_path {
			Some(file_path) => Some(
				OpenOptions::new()
					.append(true)
					.create(true)
					.open(file_path)?,
			),
			None => None,
		};
		let cur_size = match &file {
			Some(file) => file.metadata()?.len(),
			None => 0,
		};
		self.log_impl = Some(LogImpl {
			config,
			file,
			cur_size,
			last_rotation: Instant::now(),
		});
		Ok(())
	}

	/// log the specified line at the specified level
	pub fn log_level(&mut self, line: &str, level: i32) -> Result<(), Error> {
		match &mut self.log_impl {
			Some(log_impl) => log_impl.log(line, level),
			None => Err(ErrorKind::LogConfigurationError(
				"log not configured".to_string(),
			)
			.into()),
		}
	}

	/// get the current configuration, if configured
	pub fn get_config(&self) -> Result<LogConfig, Error> {
		match &self.log_impl {
			Some(log_impl) => Ok(log_impl.config.clone()),
			None => Err(ErrorKind::LogConfigurationError(
				"log not configured".to_string(),
			)
			.into()),
		}
	}
}

#[cfg(test)]
mod test {
	use crate::logger::*;

	#[test]
	fn test_log_basic() -> Result<(), Error> {
		let mut log = Log::new();
		assert!(!log.is_configured());
		assert!(log.log_level("hi", INFO).is_err());

		log.init(LogConfig {
			show_stdout: false,
			..LogConfig::default()
		})?;
		assert!(log.is_configured());
		log.log_level("hi", INFO)?;
		assert_eq!(log.get_config()?.show_stdout, false);

		Ok(())
	}

	#[test]
	fn test_log_rotation() -> Result<(), Error> {
		let dir = ".test_log_rotation.webserv";
		std::fs::create_dir_all(dir)?;
		let file_path = format!("{}/test.log", dir);
		let mut log = Log::new();
		log.init(LogConfig {
			file_path: Some(file_path.clone()),
			max_size: 100,
			show_stdout: false,
			..LogConfig::default()
		})?;

		for _ in 0..100 {
			log.log_level("0123456789", INFO)?;
		}

		// rotation must have kicked in, so the live file stays small
		assert!(std::fs::metadata(&file_path)?.len() < 10_000);
		let count = std::fs::read_dir(dir)?.count();
		assert!(count > 1);

		std::fs::remove_dir_all(dir)?;
		Ok(())
	}
}
