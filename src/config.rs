// SPDX-FileCopyrightText: 2025 blinry <mail@blinry.org>
// SPDX-FileCopyrightText: 2025 zormit <nt4u@kpvn.de>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Data structures and helper methods around influencing the configuration of
//! the application.

use ini::Ini;
use std::path::Path;

pub const DEFAULT_PORT: u16 = 8080;

/// Settings the server can pick up from the command line or a config file.
/// Command-line values win; the file fills the gaps.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppConfig {
    pub port: Option<u16>,
}

impl AppConfig {
    pub fn from_config_file(config_file: &Path) -> Option<Self> {
        if config_file.exists() {
            let conf = Ini::load_from_file(config_file)
                .expect("Could not access config file, even though it exists");
            let general_section = conf.general_section();
            Some(Self {
                port: general_section.get("port").map(|p| {
                    p.parse()
                        .expect("Failed to parse config parameter `port` as a port number")
                }),
            })
        } else {
            None
        }
    }

    #[must_use]
    pub fn merge(self, other: Option<Self>) -> Self {
        match other {
            None => self,
            Some(other) => Self {
                port: self.port.or(other.port),
            },
        }
    }

    /// The port to listen on; 8080 if nothing was configured.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_PORT)
    }
}
