/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

use std::fmt::{self, Display};
use std::io::Write;
use std::str::FromStr;

use log::{Level, LevelFilter, Log, Metadata, Record};

pub fn init() {
    let max_log_level = std::env::var("CINNABAR_LOG")
        .ok()
        .and_then(|l| LevelFilter::from_str(&l).ok())
        .unwrap_or(LevelFilter::Warn);
    if log::set_boxed_logger(Box::new(StderrLogger)).is_ok() {
        log::set_max_level(max_log_level);
    }
}

struct LevelPrinter(Level);

impl Display for LevelPrinter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Level::Warn => f.write_str("WARNING"),
            level => Display::fmt(&level, f),
        }
    }
}

struct StderrLogger;

impl Log for StderrLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let mut stderr = std::io::stderr().lock();
        writeln!(stderr, "{} {}", LevelPrinter(record.level()), record.args()).ok();
    }

    fn flush(&self) {
        std::io::stderr().flush().ok();
    }
}

#[test]
fn test_level_printer() {
    assert_eq!(LevelPrinter(Level::Warn).to_string(), "WARNING");
    assert_eq!(LevelPrinter(Level::Error).to_string(), "ERROR");
    assert_eq!(LevelPrinter(Level::Debug).to_string(), "DEBUG");
}
