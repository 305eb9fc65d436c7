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

/// Lock a rwlock in write mode, mapping a poisoned lock to the appropriate
/// error. This code was used in many places, this macro simplifies it.
#[macro_export]
macro_rules! lockw {
	($a:expr) => {
		$a.write().map_err(|e| {
			let error: webserv_err::Error = webserv_err::ErrorKind::PoisonError(format!(
				"Poison Error: {}",
				e.to_string()
			))
			.into();
			error
		})
	};
}

/// Lock a rwlock in read mode, mapping a poisoned lock to the appropriate
/// error. This code was used in many places, this macro simplifies it.
#[macro_export]
macro_rules! lockr {
	($a:expr) => {
		$a.read().map_err(|e| {
			let error: webserv_err::Error = webserv_err::ErrorKind::PoisonError(format!(
				"Poison Error: {}",
				e.to_string()
			))
			.into();
			error
		})
	};
}
