//! Reply templates and number/date formatting (Indonesian, WhatsApp markup).

use chrono::{Datelike, NaiveDate};

use crate::config::CoopProfile;

const MONTHS_ID: [&str; 12] = [
    "Jan", "Feb", "Mar", "Apr", "Mei", "Jun", "Jul", "Agu", "Sep", "Okt", "Nov", "Des",
];

/// `1250000` → `Rp 1.250.000`.
pub fn format_rupiah(amount: i64) -> String {
    let digits = amount.unsigned_abs().to_string();
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push('.');
        }
        grouped.push(ch);
    }
    if amount < 0 {
        format!("-Rp {grouped}")
    } else {
        format!("Rp {grouped}")
    }
}

/// `2024-01-05` → `5 Jan 2024`.
pub fn format_date(date: NaiveDate) -> String {
    let month = MONTHS_ID[date.month0() as usize];
    format!("{} {} {}", date.day(), month, date.year())
}

pub fn not_registered(coop: &CoopProfile) -> String {
    format!(
        "Maaf, nomor Anda belum terdaftar sebagai anggota aktif {}.\n\
         Silakan hubungi pengurus di {} untuk pendaftaran atau pembaruan nomor.",
        coop.name, coop.phone
    )
}

pub fn apology() -> String {
    "Maaf, terjadi kendala saat memproses permintaan Anda. Silakan coba lagi beberapa saat lagi."
        .to_string()
}

/// "Command not understood" with optional suggestions and the canonical list.
pub fn not_understood(input: &str, suggestions: &[String], commands: &[&str]) -> String {
    let mut out = format!("Maaf, perintah *{input}* tidak dikenali.");
    if !suggestions.is_empty() {
        let list = suggestions
            .iter()
            .map(|s| format!("*{s}*"))
            .collect::<Vec<_>>()
            .join(", ");
        out.push_str(&format!("\nMungkin maksud Anda: {list}?"));
    }
    out.push_str("\n\nPerintah yang tersedia:");
    for cmd in commands {
        out.push_str(&format!("\n• {cmd}"));
    }
    out
}
