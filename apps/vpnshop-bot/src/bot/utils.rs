use chrono::{DateTime, Utc};

pub fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// `15000` in RUB renders as `150.00 RUB`.
pub fn format_money(minor: i64, currency: &str) -> String {
    let sign = if minor < 0 { "-" } else { "" };
    let abs = minor.unsigned_abs();
    format!("{}{}.{:02} {}", sign, abs / 100, abs % 100, currency)
}

pub fn format_dt(dt: Option<DateTime<Utc>>) -> String {
    match dt {
        Some(dt) => dt.format("%d.%m.%Y %H:%M UTC").to_string(),
        None => "-".to_string(),
    }
}

/// `PAY-` plus six upper-case hex digits, quoted by the customer in the
/// transfer comment.
pub fn payment_code() -> String {
    let hex = uuid::Uuid::new_v4().simple().to_string();
    format!("PAY-{}", hex[..6].to_uppercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn money_uses_minor_units() {
        assert_eq!(format_money(15000, "RUB"), "150.00 RUB");
        assert_eq!(format_money(5, "USD"), "0.05 USD");
        assert_eq!(format_money(-250, "RUB"), "-2.50 RUB");
    }

    #[test]
    fn html_is_escaped() {
        assert_eq!(escape_html("<b>&</b>"), "&lt;b&gt;&amp;&lt;/b&gt;");
    }

    #[test]
    fn dates_render_or_dash() {
        let dt = Utc.with_ymd_and_hms(2026, 3, 9, 14, 5, 0).unwrap();
        assert_eq!(format_dt(Some(dt)), "09.03.2026 14:05 UTC");
        assert_eq!(format_dt(None), "-");
    }

    #[test]
    fn payment_code_shape() {
        let code = payment_code();
        assert_eq!(code.len(), 10);
        assert!(code.starts_with("PAY-"));
        assert!(code[4..].chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_lowercase()));
    }
}
