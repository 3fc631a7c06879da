use super::{CommandContext, CommandSpec};
use crate::{
    replies::{format_date, format_rupiah},
    Result,
};

pub(super) fn builtin() -> [CommandSpec; 6] {
    [
        CommandSpec {
            name: "saldo",
            aliases: &["balance", "simpanan"],
            description: "Cek saldo simpanan",
            handler: saldo,
        },
        CommandSpec {
            name: "pinjaman",
            aliases: &["loans", "loan", "pinjam"],
            description: "Cek pinjaman dan sisa angsuran",
            handler: pinjaman,
        },
        CommandSpec {
            name: "profil",
            aliases: &["profile"],
            description: "Lihat data keanggotaan",
            handler: profil,
        },
        CommandSpec {
            name: "info",
            aliases: &["about"],
            description: "Informasi koperasi",
            handler: info,
        },
        CommandSpec {
            name: "kontak",
            aliases: &["contact"],
            description: "Kontak pengurus",
            handler: kontak,
        },
        CommandSpec {
            name: "menu",
            aliases: &["help", "bantuan", "halo", "hai", "hi", "hello", "start"],
            description: "Tampilkan daftar perintah",
            handler: menu,
        },
    ]
}

fn saldo(ctx: &CommandContext<'_>) -> Result<String> {
    let m = ctx.member;
    let mut out = format!("*Saldo Simpanan*\n{} ({})\n", m.name, m.member_number);

    if m.savings.is_empty() {
        out.push_str("\nBelum ada catatan simpanan.");
    } else {
        for s in &m.savings {
            out.push_str(&format!(
                "\n• Simpanan {}: {}",
                s.category,
                format_rupiah(s.amount)
            ));
        }
    }

    out.push_str(&format!("\n\n*Total: {}*", format_rupiah(m.total_savings())));
    Ok(out)
}

fn pinjaman(ctx: &CommandContext<'_>) -> Result<String> {
    let m = ctx.member;
    let mut out = format!("*Pinjaman*\n{} ({})\n", m.name, m.member_number);

    let active: Vec<_> = m.active_loans().collect();
    if active.is_empty() {
        out.push_str("\nAnda tidak memiliki pinjaman aktif.");
    } else {
        for loan in &active {
            out.push_str(&format!(
                "\n• {}\n  Pokok: {}\n  Sisa: {}\n  Angsuran: {}/{}",
                loan.loan_number,
                format_rupiah(loan.principal),
                format_rupiah(loan.outstanding),
                loan.installments_paid,
                loan.installments_total
            ));
            if let Some(due) = loan.next_due {
                out.push_str(&format!("\n  Jatuh tempo berikutnya: {}", format_date(due)));
            }
        }
        out.push_str(&format!(
            "\n\n*Total sisa pinjaman: {}*",
            format_rupiah(m.outstanding_balance())
        ));
    }

    let completed = m.completed_loan_count();
    if completed > 0 {
        out.push_str(&format!("\nPinjaman lunas: {completed}"));
    }
    Ok(out)
}

fn profil(ctx: &CommandContext<'_>) -> Result<String> {
    let m = ctx.member;
    let joined = m
        .joined_at
        .map(format_date)
        .unwrap_or_else(|| "-".to_string());
    Ok(format!(
        "*Profil Anggota*\nNama: {}\nNo. Anggota: {}\nStatus: {}\nTelepon: {}\nBergabung: {}",
        m.name, m.member_number, m.status, m.phone, joined
    ))
}

fn info(ctx: &CommandContext<'_>) -> Result<String> {
    let c = ctx.coop;
    let mut out = format!(
        "*{}*\nAlamat: {}\nJam layanan: {}",
        c.name, c.address, c.office_hours
    );
    if let Some(web) = &c.website {
        out.push_str(&format!("\nWebsite: {web}"));
    }
    Ok(out)
}

fn kontak(ctx: &CommandContext<'_>) -> Result<String> {
    let c = ctx.coop;
    Ok(format!(
        "*Kontak Pengurus {}*\nTelepon: {}\nEmail: {}\nAlamat: {}",
        c.name, c.phone, c.email, c.address
    ))
}

fn menu(ctx: &CommandContext<'_>) -> Result<String> {
    let mut out = format!(
        "Halo {}, selamat datang di layanan {}.\nKetik salah satu perintah berikut:\n",
        ctx.member.name, ctx.coop.name
    );
    for cmd in ctx.catalog {
        out.push_str(&format!("\n• *{}* - {}", cmd.name, cmd.description));
    }
    Ok(out)
}
