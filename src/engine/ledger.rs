//! Session paper ledger.
//!
//! Cash and per-token share accounting for PAPER and DRY_RUN fills, plus
//! execution counters for the session summary. LIVE accounting stays on the
//! exchange; this ledger only ever sees simulated fills.

use serde::Serialize;
use std::collections::HashMap;

#[derive(Debug, Clone, Default, Serialize)]
pub struct PaperLedger {
    pub cash_usd: f64,
    pub positions: HashMap<String, PaperPosition>,
    pub total_fees_usd: f64,
    pub trade_count: u64,
    pub reject_count: u64,
    pub partial_fill_count: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PaperPosition {
    pub token_id: String,
    pub shares: f64,
    pub cost_usd: f64,
    pub avg_price: f64,
}

impl PaperLedger {
    pub fn with_cash(cash_usd: f64) -> Self {
        Self {
            cash_usd,
            ..Default::default()
        }
    }

    /// Apply a simulated buy. Returns shares acquired (0.0 on bad input).
    pub fn apply_buy(&mut self, token_id: &str, price: f64, notional: f64, fee: f64) -> f64 {
        if !(price > 0.0 && price < 1.0) || !(notional > 0.0) {
            return 0.0;
        }

        let shares = notional / price;
        self.cash_usd = (self.cash_usd - notional - fee).max(0.0);
        self.total_fees_usd += fee;
        self.trade_count += 1;

        let entry = self
            .positions
            .entry(token_id.to_string())
            .or_insert_with(|| PaperPosition {
                token_id: token_id.to_string(),
                shares: 0.0,
                cost_usd: 0.0,
                avg_price: price,
            });
        entry.cost_usd += notional;
        entry.shares += shares;
        entry.avg_price = if entry.shares > 0.0 {
            entry.cost_usd / entry.shares
        } else {
            price
        };

        shares
    }

    /// Apply a simulated sell of `shares`. Returns shares actually sold,
    /// capped at the held amount.
    pub fn apply_sell(&mut self, token_id: &str, price: f64, shares: f64, fee: f64) -> f64 {
        if !(price > 0.0 && price < 1.0) || !(shares > 0.0) {
            return 0.0;
        }
        let Some(pos) = self.positions.get_mut(token_id) else {
            return 0.0;
        };
        if !(pos.shares > 0.0) {
            return 0.0;
        }

        let sold = shares.min(pos.shares);
        let proceeds = sold * price;
        let cost_reduced = pos.avg_price * sold;

        pos.shares = (pos.shares - sold).max(0.0);
        pos.cost_usd = (pos.cost_usd - cost_reduced).max(0.0);
        self.cash_usd += (proceeds - fee).max(0.0);
        self.total_fees_usd += fee;
        self.trade_count += 1;

        if pos.shares <= 1e-9 {
            self.positions.remove(token_id);
        }

        sold
    }

    pub fn record_reject(&mut self) {
        self.reject_count += 1;
    }

    pub fn record_partial_fill(&mut self) {
        self.partial_fill_count += 1;
    }

    pub fn shares_of(&self, token_id: &str) -> f64 {
        self.positions.get(token_id).map(|p| p.shares).unwrap_or(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buy_then_sell_roundtrip() {
        let mut ledger = PaperLedger::with_cash(100.0);
        let shares = ledger.apply_buy("t1", 0.50, 10.0, 0.05);
        assert!((shares - 20.0).abs() < 1e-9);
        assert!((ledger.cash_usd - 89.95).abs() < 1e-9);
        assert!((ledger.shares_of("t1") - 20.0).abs() < 1e-9);

        let sold = ledger.apply_sell("t1", 0.60, 20.0, 0.06);
        assert!((sold - 20.0).abs() < 1e-9);
        assert!((ledger.cash_usd - 89.95 - 11.94).abs() < 1e-9);
        assert_eq!(ledger.shares_of("t1"), 0.0);
        assert_eq!(ledger.trade_count, 2);
    }

    #[test]
    fn sell_caps_at_held_shares() {
        let mut ledger = PaperLedger::with_cash(100.0);
        ledger.apply_buy("t1", 0.50, 5.0, 0.0);
        let sold = ledger.apply_sell("t1", 0.50, 999.0, 0.0);
        assert!((sold - 10.0).abs() < 1e-9);
    }

    #[test]
    fn avg_price_tracks_cost_basis() {
        let mut ledger = PaperLedger::with_cash(100.0);
        ledger.apply_buy("t1", 0.40, 4.0, 0.0); // 10 shares
        ledger.apply_buy("t1", 0.60, 6.0, 0.0); // 10 shares
        let pos = ledger.positions.get("t1").unwrap();
        assert!((pos.shares - 20.0).abs() < 1e-9);
        assert!((pos.avg_price - 0.50).abs() < 1e-9);
    }

    #[test]
    fn rejects_out_of_range_prices() {
        let mut ledger = PaperLedger::with_cash(100.0);
        assert_eq!(ledger.apply_buy("t1", 0.0, 5.0, 0.0), 0.0);
        assert_eq!(ledger.apply_buy("t1", 1.0, 5.0, 0.0), 0.0);
        assert_eq!(ledger.cash_usd, 100.0);
    }
}
