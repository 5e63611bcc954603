use super::Codec;
use crate::error::{CodecError, Result};
use crate::message::{Message, RawPayload};
use chrono::{Datelike, FixedOffset, Utc};
use syslog_loose::{ProcId, SyslogFacility, SyslogSeverity, Variant};

const FACILITIES: [&str; 24] = [
    "kern", "user", "mail", "daemon", "auth", "syslog", "lpr", "news", "uucp", "cron", "authpriv",
    "ftp", "ntp", "security", "console", "solaris-cron", "local0", "local1", "local2", "local3",
    "local4", "local5", "local6", "local7",
];

/// Decodes RFC 5424 and RFC 3164 syslog lines.
///
/// Every message gets `facility` (name) and `level` (severity number) from
/// its PRI. Header parts become `application_name`, `process_id` and
/// `message_id`; RFC 5424 structured data parameters become fields named
/// after the parameter. RFC 3164 timestamps carry no year or zone and are
/// read as UTC in the year the payload was received.
#[derive(Debug, Default)]
pub struct SyslogCodec;

impl SyslogCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Codec for SyslogCodec {
    fn name(&self) -> &'static str {
        "syslog"
    }

    fn decode(&self, payload: RawPayload) -> Result<Vec<Message>> {
        let text = String::from_utf8_lossy(&payload.bytes);
        let line = text.trim_end_matches(['\n', '\r', '\0']);
        if line.is_empty() {
            return Ok(Vec::new());
        }

        let year = payload.received_at.year();
        let parsed = syslog_loose::parse_message_with_year_tz(
            line,
            |_| year,
            FixedOffset::east_opt(0),
            Variant::Either,
        );

        // The parser falls back to a bare message when the PRI is unusable.
        let (Some(facility), Some(severity)) = (parsed.facility, parsed.severity) else {
            return Err(CodecError::Syslog(format!(
                "missing or invalid PRI in '{}'",
                line.chars().take(32).collect::<String>()
            )));
        };

        let timestamp = parsed
            .timestamp
            .map(|ts| ts.with_timezone(&Utc))
            .unwrap_or(payload.received_at);
        let source = parsed
            .hostname
            .filter(|host| !host.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| payload.remote_host());
        let text = parsed.msg.strip_prefix('\u{feff}').unwrap_or(parsed.msg);

        let mut message =
            Message::new(source, timestamp, text).with_remote_addr(payload.remote_addr);
        if let Some(app_name) = parsed.appname {
            message.add_field("application_name", app_name);
        }
        match parsed.procid {
            Some(ProcId::PID(pid)) => message.add_field("process_id", pid.to_string()),
            Some(ProcId::Name(name)) => message.add_field("process_id", name),
            None => {}
        }
        if let Some(msg_id) = parsed.msgid {
            message.add_field("message_id", msg_id);
        }
        for element in &parsed.structured_data {
            for (name, value) in element.params() {
                message.add_field(name.to_string(), value.to_string());
            }
        }

        message.add_field("facility", FACILITIES[facility_code(facility)]);
        message.add_field("level", severity_code(severity));
        Ok(vec![message])
    }
}

fn facility_code(facility: SyslogFacility) -> usize {
    match facility {
        SyslogFacility::LOG_KERN => 0,
        SyslogFacility::LOG_USER => 1,
        SyslogFacility::LOG_MAIL => 2,
        SyslogFacility::LOG_DAEMON => 3,
        SyslogFacility::LOG_AUTH => 4,
        SyslogFacility::LOG_SYSLOG => 5,
        SyslogFacility::LOG_LPR => 6,
        SyslogFacility::LOG_NEWS => 7,
        SyslogFacility::LOG_UUCP => 8,
        SyslogFacility::LOG_CRON => 9,
        SyslogFacility::LOG_AUTHPRIV => 10,
        SyslogFacility::LOG_FTP => 11,
        SyslogFacility::LOG_NTP => 12,
        SyslogFacility::LOG_AUDIT => 13,
        SyslogFacility::LOG_ALERT => 14,
        SyslogFacility::LOG_CLOCKD => 15,
        SyslogFacility::LOG_LOCAL0 => 16,
        SyslogFacility::LOG_LOCAL1 => 17,
        SyslogFacility::LOG_LOCAL2 => 18,
        SyslogFacility::LOG_LOCAL3 => 19,
        SyslogFacility::LOG_LOCAL4 => 20,
        SyslogFacility::LOG_LOCAL5 => 21,
        SyslogFacility::LOG_LOCAL6 => 22,
        SyslogFacility::LOG_LOCAL7 => 23,
    }
}

fn severity_code(severity: SyslogSeverity) -> u8 {
    match severity {
        SyslogSeverity::SEV_EMERG => 0,
        SyslogSeverity::SEV_ALERT => 1,
        SyslogSeverity::SEV_CRIT => 2,
        SyslogSeverity::SEV_ERR => 3,
        SyslogSeverity::SEV_WARNING => 4,
        SyslogSeverity::SEV_NOTICE => 5,
        SyslogSeverity::SEV_INFO => 6,
        SyslogSeverity::SEV_DEBUG => 7,
    }
}
