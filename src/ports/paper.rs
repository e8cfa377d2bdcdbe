use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use super::execution::{GatewayError, OrderResult, OrderSide, OrderStatus, PositionSnapshot};

#[derive(Debug, Clone, Default)]
struct PaperPosition {
    size: Decimal,
    entry_price: Decimal,
}

#[derive(Debug, Default)]
struct BookState {
    cash: Decimal,
    realized_pnl: Decimal,
    positions: HashMap<String, PaperPosition>,
    leverage: HashMap<String, u32>,
    next_order_id: u64,
}

/// Simulated margin account used by dry-run and replay. Fills are immediate
/// and complete at the price supplied by the caller.
#[derive(Debug)]
pub struct PaperBook {
    state: Mutex<BookState>,
}

impl PaperBook {
    pub fn new(initial_equity: Decimal) -> Self {
        Self {
            state: Mutex::new(BookState {
                cash: initial_equity,
                ..BookState::default()
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BookState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_leverage(&self, symbol: &str, leverage: u32) {
        self.lock().leverage.insert(symbol.to_string(), leverage.max(1));
    }

    pub fn realized_pnl(&self) -> Decimal {
        self.lock().realized_pnl
    }

    /// Equity plus unrealized PnL minus the margin held by open positions.
    /// Symbols without a mark are valued at their entry price.
    pub fn available_margin<F>(&self, mark: F) -> Decimal
    where
        F: Fn(&str) -> Option<Decimal>,
    {
        let state = self.lock();
        Self::available_locked(&state, &mark)
    }

    fn available_locked<F>(state: &BookState, mark: &F) -> Decimal
    where
        F: Fn(&str) -> Option<Decimal>,
    {
        let mut available = state.cash;
        for (symbol, pos) in &state.positions {
            let price = mark(symbol).unwrap_or(pos.entry_price);
            let leverage = Decimal::from(*state.leverage.get(symbol).unwrap_or(&1));
            available += pos.size * (price - pos.entry_price);
            available -= pos.size.abs() * price / leverage;
        }
        available
    }

    pub fn positions<F>(&self, mark: F) -> Vec<PositionSnapshot>
    where
        F: Fn(&str) -> Option<Decimal>,
    {
        let state = self.lock();
        let mut out: Vec<PositionSnapshot> = state
            .positions
            .iter()
            .filter(|(_, pos)| !pos.size.is_zero())
            .map(|(symbol, pos)| {
                let price = mark(symbol).unwrap_or(pos.entry_price);
                PositionSnapshot {
                    symbol: symbol.clone(),
                    size: pos.size,
                    entry_price: Some(pos.entry_price),
                    unrealized_pnl: pos.size * (price - pos.entry_price),
                }
            })
            .collect();
        out.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        out
    }

    pub fn fill<F>(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: Decimal,
        price: Decimal,
        reduce_only: bool,
        mark: F,
    ) -> Result<OrderResult, GatewayError>
    where
        F: Fn(&str) -> Option<Decimal>,
    {
        if quantity <= Decimal::ZERO {
            return Err(GatewayError::Rejected(format!(
                "non-positive quantity {} for {}",
                quantity, symbol
            )));
        }
        if price <= Decimal::ZERO {
            return Err(GatewayError::Rejected(format!(
                "no valid price for {}",
                symbol
            )));
        }
        let mut state = self.lock();
        let current = state
            .positions
            .get(symbol)
            .cloned()
            .unwrap_or_default();
        let direction = match side {
            OrderSide::Buy => Decimal::ONE,
            OrderSide::Sell => Decimal::NEGATIVE_ONE,
        };
        let increases = current.size.is_zero()
            || current.size.is_sign_positive() == direction.is_sign_positive();

        let quantity = if reduce_only {
            if increases {
                return Err(GatewayError::ReduceOnlyRejected(format!(
                    "{} {} would not reduce position {}",
                    side, symbol, current.size
                )));
            }
            quantity.min(current.size.abs())
        } else {
            quantity
        };

        if increases {
            let leverage = Decimal::from(*state.leverage.get(symbol).unwrap_or(&1));
            let required = quantity * price / leverage;
            let available = Self::available_locked(&state, &mark);
            if required > available {
                return Err(GatewayError::InsufficientFunds(format!(
                    "required {} available {}",
                    required.round_dp(4),
                    available.round_dp(4)
                )));
            }
        }

        let delta = quantity * direction;
        let next = if increases {
            let new_size = current.size + delta;
            let entry_price = (current.size.abs() * current.entry_price + quantity * price)
                / new_size.abs();
            PaperPosition {
                size: new_size,
                entry_price,
            }
        } else {
            let closed = quantity.min(current.size.abs());
            let sign = if current.size.is_sign_negative() {
                Decimal::NEGATIVE_ONE
            } else {
                Decimal::ONE
            };
            let pnl = closed * (price - current.entry_price) * sign;
            state.cash += pnl;
            state.realized_pnl += pnl;
            let new_size = current.size + delta;
            let entry_price = if new_size.is_zero() || new_size.is_sign_positive() == sign.is_sign_positive() {
                current.entry_price
            } else {
                price
            };
            PaperPosition {
                size: new_size,
                entry_price,
            }
        };

        if next.size.is_zero() {
            state.positions.remove(symbol);
        } else {
            state.positions.insert(symbol.to_string(), next);
        }
        state.next_order_id += 1;
        Ok(OrderResult {
            id: format!("paper-{}", state.next_order_id),
            status: OrderStatus::Filled,
            filled_quantity: quantity,
            avg_price: Some(price),
        })
    }
}
