use crate::domain::money::format_gross_amount;
use crate::domain::wallet::Wallet;
use crate::error::Result;
use std::io::Write;

/// Writes the wallet table as CSV: `creator_id,wallet_id,balance`.
pub struct WalletWriter<W: Write> {
    writer: csv::Writer<W>,
}

impl<W: Write> WalletWriter<W> {
    pub fn new(sink: W) -> Self {
        Self {
            writer: csv::Writer::from_writer(sink),
        }
    }

    pub fn write_wallets(&mut self, wallets: impl IntoIterator<Item = Wallet>) -> Result<()> {
        self.writer.write_record(["creator_id", "wallet_id", "balance"])?;
        for wallet in wallets {
            self.writer.write_record([
                wallet.creator_id.to_string(),
                wallet.id.to_string(),
                format_gross_amount(wallet.balance.value()),
            ])?;
        }
        self.writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::money::Balance;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    #[test]
    fn test_writes_header_and_two_decimal_balances() {
        let mut wallet = Wallet::new(Uuid::new_v4());
        wallet.balance = Balance::new(dec!(1500.5));

        let mut out = Vec::new();
        WalletWriter::new(&mut out).write_wallets(vec![wallet.clone()]).unwrap();
        let text = String::from_utf8(out).unwrap();

        let mut lines = text.lines();
        assert_eq!(lines.next(), Some("creator_id,wallet_id,balance"));
        assert_eq!(
            lines.next(),
            Some(format!("{},{},1500.50", wallet.creator_id, wallet.id).as_str())
        );
    }
}
