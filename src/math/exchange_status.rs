use crate::types::{
    MarketAccount, State, EXCHANGE_STATUS_AMM_PAUSED, EXCHANGE_STATUS_FILL_PAUSED,
    EXCHANGE_STATUS_PAUSED, PERP_OPERATION_FILL, SPOT_OPERATION_FILL,
};

pub fn fill_paused(state_account: &State, market: &MarketAccount) -> bool {
    if is_operation_paused(state_account.exchange_status, EXCHANGE_STATUS_FILL_PAUSED) {
        return true;
    }

    match market {
        MarketAccount::Perp(perp) => is_operation_paused(perp.paused_operations, PERP_OPERATION_FILL),
        MarketAccount::Spot(spot) => is_operation_paused(spot.paused_operations, SPOT_OPERATION_FILL),
    }
}

pub fn amm_paused(state_account: &State, _market: &MarketAccount) -> bool {
    is_operation_paused(state_account.exchange_status, EXCHANGE_STATUS_AMM_PAUSED)
}

pub fn exchange_paused(state_account: &State) -> bool {
    is_operation_paused(state_account.exchange_status, EXCHANGE_STATUS_PAUSED)
}

fn is_operation_paused(flags: u8, flag: u8) -> bool {
    (flags & flag) == flag
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PerpMarket;

    #[test]
    fn fill_paused_checks_both_exchange_and_market_flags() {
        let active = State::default();
        let perp = MarketAccount::Perp(PerpMarket::default());
        assert!(!fill_paused(&active, &perp));

        let paused = State {
            exchange_status: EXCHANGE_STATUS_FILL_PAUSED,
            ..State::default()
        };
        assert!(fill_paused(&paused, &perp));

        let market_paused = MarketAccount::Perp(PerpMarket {
            paused_operations: PERP_OPERATION_FILL,
            ..PerpMarket::default()
        });
        assert!(fill_paused(&active, &market_paused));
    }

    #[test]
    fn amm_paused_reads_the_exchange_flag() {
        let active = State::default();
        let spot = MarketAccount::Spot(crate::types::SpotMarket::default());
        assert!(!amm_paused(&active, &spot));

        let paused = State {
            exchange_status: EXCHANGE_STATUS_AMM_PAUSED,
            ..State::default()
        };
        assert!(amm_paused(&paused, &spot));
    }
}
