use ethers::types::U256;
use serde::{Deserialize, Serialize};

/// Gas price, carried as either the legacy single-price model or the
/// EIP-1559 fee/tip split. Bump logic (§4.3) is defined once on this type
/// so callers never branch on the variant themselves.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum GasPrice {
    Legacy(U256),
    Eip1559 {
        max_fee_per_gas: U256,
        max_priority_fee_per_gas: U256,
    },
}

impl GasPrice {
    #[must_use]
    pub fn zero() -> Self {
        Self::Legacy(U256::zero())
    }

    /// The value used for affordability checks (§4.2: `gasLimit * gasPrice`)
    /// and for comparisons against the tracker's staleness margin (§4.3).
    #[must_use]
    pub fn effective_price(&self) -> U256 {
        match self {
            Self::Legacy(price) => *price,
            Self::Eip1559 {
                max_fee_per_gas, ..
            } => *max_fee_per_gas,
        }
    }

    /// Applies the §4.3 bump formula:
    /// `max(previous * (1 + bumpPercent), previous + bumpAbsolute)`, capped
    /// at `ceiling`. Returns a new `GasPrice` of the same variant.
    #[must_use]
    pub fn bump(&self, bump_percent: u32, bump_absolute: U256, ceiling: U256) -> Self {
        let bump_one = |price: U256| -> U256 {
            let percent_bumped = price.saturating_mul(U256::from(100 + bump_percent)) / U256::from(100);
            let absolute_bumped = price.saturating_add(bump_absolute);
            percent_bumped.max(absolute_bumped).min(ceiling)
        };

        match self {
            Self::Legacy(price) => Self::Legacy(bump_one(*price)),
            Self::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            } => Self::Eip1559 {
                max_fee_per_gas: bump_one(*max_fee_per_gas),
                max_priority_fee_per_gas: bump_one(*max_priority_fee_per_gas),
            },
        }
    }

    /// Whether `self` is already at (or above) `ceiling` for every
    /// component, meaning a further bump would be suppressed (§4.3).
    #[must_use]
    pub fn at_ceiling(&self, ceiling: U256) -> bool {
        match self {
            Self::Legacy(price) => *price >= ceiling,
            Self::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            } => *max_fee_per_gas >= ceiling && *max_priority_fee_per_gas >= ceiling,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bump_increases_legacy_price_and_respects_ceiling() {
        let price = GasPrice::Legacy(U256::from(100));
        let ceiling = U256::from(1_000);

        let bumped = price.bump(10, U256::from(5), ceiling);
        assert_eq!(bumped, GasPrice::Legacy(U256::from(110)));

        let capped = GasPrice::Legacy(U256::from(950)).bump(50, U256::from(5), ceiling);
        assert_eq!(capped, GasPrice::Legacy(ceiling));
    }

    #[test]
    fn bump_always_strictly_increases_when_below_ceiling() {
        let ceiling = U256::from(u64::MAX);
        for start in [1u64, 10, 100, 1_000_000] {
            let price = GasPrice::Legacy(U256::from(start));
            let bumped = price.bump(10, U256::from(1), ceiling);
            assert!(bumped.effective_price() > price.effective_price());
        }
    }

    #[test]
    fn bump_on_eip1559_bumps_both_components() {
        let price = GasPrice::Eip1559 {
            max_fee_per_gas: U256::from(100),
            max_priority_fee_per_gas: U256::from(10),
        };
        let ceiling = U256::from(1_000);
        let bumped = price.bump(10, U256::from(1), ceiling);
        assert_eq!(
            bumped,
            GasPrice::Eip1559 {
                max_fee_per_gas: U256::from(110),
                max_priority_fee_per_gas: U256::from(11),
            }
        );
    }

    #[test]
    fn at_ceiling_detects_saturation() {
        let ceiling = U256::from(100);
        assert!(GasPrice::Legacy(U256::from(100)).at_ceiling(ceiling));
        assert!(!GasPrice::Legacy(U256::from(99)).at_ceiling(ceiling));
    }
}
