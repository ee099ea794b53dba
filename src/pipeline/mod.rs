//! Log pipelines (spec.md section 4.6): file tailing, syslog reception, and the
//! access/error log parsers collectors drive off of them.

pub mod accesslog;
pub mod errorlog;
pub mod filetail;
pub mod syslog;

pub use accesslog::{AccessLogFormat, COMBINED_FORMAT};
pub use errorlog::{classify as classify_error_line, ZERO_COUNTERS as ERROR_ZERO_COUNTERS};
pub use filetail::FileTail;
pub use syslog::{SyslogCache, SyslogListener};
