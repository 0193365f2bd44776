use chrono::{DateTime, Local};

/// Moment-style tokens and their chrono equivalents, longest first
const TOKENS: [(&str, &str); 12] = [
    ("YYYY", "%Y"),
    ("SSS", "%3f"),
    ("YY", "%y"),
    ("MM", "%m"),
    ("DD", "%d"),
    ("HH", "%H"),
    ("hh", "%I"),
    ("mm", "%M"),
    ("ss", "%S"),
    ("ZZ", "%z"),
    ("Z", "%:z"),
    ("A", "%p"),
];

/// A log timestamp format written with moment-style tokens (`YYYY-MM-DD HH:mm:ss Z`).
///
/// Text inside `[...]` is copied literally, as are characters that are not tokens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimestampFormat {
    strftime: String,
}

impl TimestampFormat {
    pub fn parse(source: &str) -> Self {
        let mut strftime = String::with_capacity(source.len() * 2);
        let mut rest = source;

        'outer: while !rest.is_empty() {
            if let Some(escaped) = rest.strip_prefix('[') {
                if let Some(end) = escaped.find(']') {
                    push_literal(&mut strftime, &escaped[..end]);
                    rest = &escaped[end + 1..];
                    continue;
                }
            }

            for (token, spec) in TOKENS {
                if let Some(after) = rest.strip_prefix(token) {
                    strftime.push_str(spec);
                    rest = after;
                    continue 'outer;
                }
            }

            let mut chars = rest.chars();
            if let Some(c) = chars.next() {
                push_literal(&mut strftime, c.encode_utf8(&mut [0; 4]));
            }
            rest = chars.as_str();
        }

        Self { strftime }
    }

    pub fn render(&self, at: &DateTime<Local>) -> String {
        at.format(&self.strftime).to_string()
    }

    pub fn now(&self) -> String {
        self.render(&Local::now())
    }
}

fn push_literal(out: &mut String, text: &str) {
    for c in text.chars() {
        if c == '%' {
            out.push_str("%%");
        } else {
            out.push(c);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_default_format_translation() {
        let format = TimestampFormat::parse("YYYY-MM-DD HH:mm:ss Z");
        assert_eq!(format.strftime, "%Y-%m-%d %H:%M:%S %:z");
    }

    #[test]
    fn test_render_fixed_time() {
        let format = TimestampFormat::parse("YYYY-MM-DD HH:mm:ss.SSS");
        let at = Local.with_ymd_and_hms(2024, 3, 9, 7, 5, 1).unwrap();
        assert_eq!(format.render(&at), "2024-03-09 07:05:01.000");
    }

    #[test]
    fn test_literals_and_escapes() {
        let format = TimestampFormat::parse("[at] HH:mm 100%");
        assert_eq!(format.strftime, "at %H:%M 100%%");
    }

    #[test]
    fn test_twelve_hour_clock() {
        let format = TimestampFormat::parse("hh:mm A");
        let at = Local.with_ymd_and_hms(2024, 1, 1, 15, 30, 0).unwrap();
        assert_eq!(format.render(&at), "03:30 PM");
    }
}
