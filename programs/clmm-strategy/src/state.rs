// state.rs
//
// Ledger records plus the rules every mutating instruction consults before it
// touches an account: capability gating, keeper accounting, tick thresholds,
// the vault fee and the position state machine.

use anchor_lang::prelude::*;

use crate::StrategyError;

pub const GLOBAL_STATE_SEED: &[u8] = b"global-state";
pub const SOL_TREASURY_SEED: &[u8] = b"sol-vault";
pub const WHITELIST_SEED: &[u8] = b"whitelist-state";
pub const KEEPER_SEED: &[u8] = b"keeper-state";
pub const USER_STATE_SEED: &[u8] = b"user-state";

pub const ALL_BASIS_POINTS: u16 = 10_000;

// ============ ENUMS ============

/// Which pool asset rests in the holding vault.
#[derive(AnchorSerialize, AnchorDeserialize, Clone, Copy, PartialEq, Eq, Debug)]
pub enum TokenSide {
    Token0,
    Token1,
}

impl TokenSide {
    /// CLMM `base_flag`: true when amount_0 is the base amount.
    pub fn base_flag(self) -> bool {
        matches!(self, TokenSide::Token0)
    }

    /// (amount_0, amount_1) with `amount` on this side and zero on the other.
    pub fn split(self, amount: u64) -> (u64, u64) {
        self.pair(amount, 0)
    }

    /// (amount_0, amount_1) with `amount` on this side and `other` on the opposite one.
    pub fn pair(self, amount: u64, other: u64) -> (u64, u64) {
        match self {
            TokenSide::Token0 => (amount, other),
            TokenSide::Token1 => (other, amount),
        }
    }

    pub fn other(self) -> TokenSide {
        match self {
            TokenSide::Token0 => TokenSide::Token1,
            TokenSide::Token1 => TokenSide::Token0,
        }
    }

    /// A position holds only this token while the tick sits in this band.
    pub fn home_band(self) -> RangeBand {
        match self {
            TokenSide::Token0 => RangeBand::Below,
            TokenSide::Token1 => RangeBand::Above,
        }
    }
}

/// Where the pool tick sits relative to a position's range.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RangeBand {
    Below,
    InRange,
    Above,
}

/// How vaulted funds leave the holding vault.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Redeploy {
    /// Tick is outside the range on the vaulted side: deposit that token alone.
    SingleSided(TokenSide),
    /// Tick is inside the range: restore the recorded liquidity. The other token
    /// comes from treasury reserves.
    Liquidity { side: TokenSide, liquidity: u128 },
    /// Tick is where the market cannot take the vaulted token: pay it to the user.
    Payout(TokenSide),
}

impl Redeploy {
    pub fn side(&self) -> TokenSide {
        match *self {
            Redeploy::SingleSided(side) | Redeploy::Payout(side) => side,
            Redeploy::Liquidity { side, .. } => side,
        }
    }
}

#[derive(AnchorSerialize, AnchorDeserialize, Clone, Copy, PartialEq, Eq, Debug)]
pub enum Action {
    CreatePosition,
    IncreasePosition,
    DecreasePosition,
}

impl Action {
    const fn bit(self) -> u8 {
        match self {
            Action::CreatePosition => 0b001,
            Action::IncreasePosition => 0b010,
            Action::DecreasePosition => 0b100,
        }
    }
}

/// Named capabilities packed into one byte.
#[derive(AnchorSerialize, AnchorDeserialize, Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct ActionSet {
    bits: u8,
}

impl ActionSet {
    pub const fn empty() -> Self {
        Self { bits: 0 }
    }

    pub const fn all() -> Self {
        Self {
            bits: Action::CreatePosition.bit()
                | Action::IncreasePosition.bit()
                | Action::DecreasePosition.bit(),
        }
    }

    pub fn contains(self, action: Action) -> bool {
        self.bits & action.bit() != 0
    }

    pub fn with(self, action: Action, enabled: bool) -> Self {
        let bits = if enabled {
            self.bits | action.bit()
        } else {
            self.bits & !action.bit()
        };
        Self { bits }
    }
}

#[derive(AnchorSerialize, AnchorDeserialize, Clone, Copy, PartialEq, Eq, Debug)]
pub enum PositionState {
    /// Liquidity sits in the CLMM position.
    Deployed,
    /// Liquidity was pulled out and one side parked in the holding vault.
    Vaulted(TokenSide),
}

/// One admin mutation. Each variant carries only its own payload.
#[derive(AnchorSerialize, AnchorDeserialize, Clone, Copy, PartialEq, Eq, Debug)]
pub enum ConfigChange {
    Admin(Pubkey),
    Action { action: Action, enabled: bool },
    CreditsForDecrease(u64),
    CreditsForIncrease(u64),
    SolPerCredit(u64),
    BaseDeposit(u64),
    FeeBasisPoints(u16),
}

impl ConfigChange {
    pub fn field(&self) -> &'static str {
        match self {
            ConfigChange::Admin(_) => "admin",
            ConfigChange::Action { .. } => "enabled_actions",
            ConfigChange::CreditsForDecrease(_) => "credits_for_decrease",
            ConfigChange::CreditsForIncrease(_) => "credits_for_increase",
            ConfigChange::SolPerCredit(_) => "sol_per_credit",
            ConfigChange::BaseDeposit(_) => "base_deposit",
            ConfigChange::FeeBasisPoints(_) => "fee_basis_points",
        }
    }
}

/// User-chosen trigger bands around the position's own range.
#[derive(AnchorSerialize, AnchorDeserialize, Clone, Copy, PartialEq, Eq, Debug)]
pub struct TickThresholds {
    pub lower_out: i32,
    pub lower_in: i32,
    pub upper_in: i32,
    pub upper_out: i32,
}

impl TickThresholds {
    /// out_lower <= in_lower < tick_lower < tick_upper < in_upper <= out_upper
    pub fn validate(&self, tick_lower: i32, tick_upper: i32) -> Result<()> {
        require!(
            self.lower_out <= self.lower_in
                && self.lower_in < tick_lower
                && tick_lower < tick_upper
                && tick_upper < self.upper_in
                && self.upper_in <= self.upper_out,
            StrategyError::InvalidTickThresholds
        );
        Ok(())
    }
}

// ============ STATE ============

#[account]
pub struct GlobalConfig {
    pub admin: Pubkey,
    pub enabled_actions: ActionSet,
    pub credits_for_decrease: u64,
    pub credits_for_increase: u64,
    pub sol_per_credit: u64,      // lamports per credit on redemption
    pub base_deposit: u64,        // lamports locked per registered position
    pub fee_basis_points: u16,    // charged on vault gains at redeployment
    pub sol_treasury: Pubkey,
    pub config_version: u64,      // bumped on every admin mutation
    pub bump: u8,
    pub treasury_bump: u8,
}

impl GlobalConfig {
    // 8 (disc) + 32 (admin) + 1 (actions) + 8*4 (credits, sol_per_credit, base_deposit)
    // + 2 (fee) + 32 (treasury) + 8 (version) + 1+1 (bumps)
    pub const SIZE: usize = 8 + 32 + 1 + 8 + 8 + 8 + 8 + 2 + 32 + 8 + 1 + 1;

    pub fn require_admin(&self, caller: &Pubkey) -> Result<()> {
        require_keys_eq!(*caller, self.admin, StrategyError::UnauthorizedAdmin);
        Ok(())
    }

    pub fn require_action(&self, action: Action) -> Result<()> {
        if self.enabled_actions.contains(action) {
            return Ok(());
        }
        match action {
            Action::CreatePosition => err!(StrategyError::NotOpen),
            Action::IncreasePosition | Action::DecreasePosition => {
                err!(StrategyError::UnauthorizedAction)
            }
        }
    }

    /// Applies one change and advances `config_version`.
    /// Nothing is written if the change is rejected.
    pub fn apply_change(&mut self, change: &ConfigChange) -> Result<()> {
        let next_version = self.config_version.checked_add(1).ok_or(StrategyError::Overflow)?;
        match *change {
            ConfigChange::Admin(admin) => self.admin = admin,
            ConfigChange::Action { action, enabled } => {
                self.enabled_actions = self.enabled_actions.with(action, enabled)
            }
            ConfigChange::CreditsForDecrease(credits) => self.credits_for_decrease = credits,
            ConfigChange::CreditsForIncrease(credits) => self.credits_for_increase = credits,
            ConfigChange::SolPerCredit(lamports) => self.sol_per_credit = lamports,
            ConfigChange::BaseDeposit(lamports) => self.base_deposit = lamports,
            ConfigChange::FeeBasisPoints(bps) => {
                require!(bps <= ALL_BASIS_POINTS, StrategyError::FeeTooHigh);
                self.fee_basis_points = bps;
            }
        }
        self.config_version = next_version;
        Ok(())
    }

    /// Splits a vault withdrawal into (redeploy, fee). The fee applies to the gain only.
    pub fn split_withdrawal(&self, deposited: u64, withdrawn: u64) -> Result<(u64, u64)> {
        if withdrawn <= deposited {
            return Ok((withdrawn, 0));
        }
        let gain = withdrawn.checked_sub(deposited).ok_or(StrategyError::Overflow)?;
        let fee = (gain as u128)
            .checked_mul(self.fee_basis_points as u128).ok_or(StrategyError::Overflow)?
            .checked_div(ALL_BASIS_POINTS as u128).ok_or(StrategyError::Overflow)?;
        let fee = u64::try_from(fee).map_err(|_| StrategyError::Overflow)?;
        let redeploy = withdrawn.checked_sub(fee).ok_or(StrategyError::Overflow)?;
        Ok((redeploy, fee))
    }

    /// Restoring liquidity inside the range pays half, rounded down.
    pub fn increase_credits(&self, plan: &Redeploy) -> u64 {
        match plan {
            Redeploy::Liquidity { .. } => self.credits_for_increase.checked_div(2).unwrap_or_default(),
            Redeploy::SingleSided(_) | Redeploy::Payout(_) => self.credits_for_increase,
        }
    }

    /// Lamports owed for `credits`, computed wide then narrowed.
    pub fn redemption_payout(&self, credits: u64) -> Result<u64> {
        let payout = (credits as u128)
            .checked_mul(self.sol_per_credit as u128)
            .ok_or(StrategyError::Overflow)?;
        Ok(u64::try_from(payout).map_err(|_| StrategyError::Overflow)?)
    }
}

/// Program-owned lamport store that funds keeper redemptions.
#[account]
pub struct SolTreasury {
    pub bump: u8,
}

impl SolTreasury {
    pub const SIZE: usize = 8 + 1;

    /// Withdrawals may never dip below the rent-exempt floor.
    pub fn check_withdrawal(balance: u64, rent_floor: u64, amount: u64) -> Result<()> {
        require!(
            amount <= balance.saturating_sub(rent_floor),
            StrategyError::InsufficientTreasury
        );
        Ok(())
    }
}

#[account]
pub struct WhitelistEntry {
    pub mint: Pubkey,
    pub bump: u8,
}

impl WhitelistEntry {
    pub const SIZE: usize = 8 + 32 + 1;
}

#[account]
pub struct KeeperAccount {
    pub keeper: Pubkey,
    pub credits: u64,
    pub bump: u8,
}

impl KeeperAccount {
    pub const SIZE: usize = 8 + 32 + 8 + 1;

    pub fn require_keeper(&self, caller: &Pubkey) -> Result<()> {
        require_keys_eq!(*caller, self.keeper, StrategyError::UnauthorizedKeeper);
        Ok(())
    }

    pub fn credit(&mut self, credits: u64) -> Result<()> {
        self.credits = self.credits.checked_add(credits).ok_or(StrategyError::Overflow)?;
        Ok(())
    }

    /// Drains the whole balance for redemption.
    pub fn take_credits(&mut self) -> Result<u64> {
        require!(self.credits > 0, StrategyError::InsufficientCredits);
        let credits = self.credits;
        self.credits = 0;
        Ok(credits)
    }
}

#[account]
pub struct UserPositionRecord {
    pub user: Pubkey,
    pub nft_mint: Pubkey,
    pub nft_token_program: Pubkey,        // SPL Token or Token-2022, fixes the custody ATA
    pub pool: Pubkey,
    pub personal_position: Pubkey,
    pub tick_lower_index: i32,
    pub tick_upper_index: i32,
    pub tick_lower_out_threshold: i32,
    pub tick_upper_out_threshold: i32,
    pub tick_lower_in_threshold: i32,
    pub tick_upper_in_threshold: i32,
    pub liquidity: u128,                  // last liquidity removed, zero while deployed
    pub amount_deposited_into_vault: u64,
    pub lp_amount: u64,
    pub state: PositionState,
    pub bump: u8,
}

impl UserPositionRecord {
    // 8 (disc) + 32*5 (keys) + 4*6 (ticks) + 16 (liquidity) + 8+8 (vault amounts)
    // + 2 (state, tag + side) + 1 (bump)
    pub const SIZE: usize = 8 + 32 + 32 + 32 + 32 + 32 + 4 * 6 + 16 + 8 + 8 + 2 + 1;

    pub fn thresholds(&self) -> TickThresholds {
        TickThresholds {
            lower_out: self.tick_lower_out_threshold,
            lower_in: self.tick_lower_in_threshold,
            upper_in: self.tick_upper_in_threshold,
            upper_out: self.tick_upper_out_threshold,
        }
    }

    /// Side to vault once the pool tick has left the out-thresholds.
    pub fn decrease_side(&self, tick_current: i32) -> Result<TokenSide> {
        require!(self.state == PositionState::Deployed, StrategyError::PositionDeployed);
        let thresholds = self.thresholds();
        if tick_current < thresholds.lower_out {
            Ok(TokenSide::Token0)
        } else if tick_current > thresholds.upper_out {
            Ok(TokenSide::Token1)
        } else {
            err!(StrategyError::TickNotOutOfRange)
        }
    }

    pub fn vaulted_side(&self) -> Result<TokenSide> {
        match self.state {
            PositionState::Vaulted(side) => Ok(side),
            PositionState::Deployed => err!(StrategyError::PositionNotDeployed),
        }
    }

    /// Market band of `tick` relative to the position's own `[tick_lower, tick_upper)`.
    pub fn band(&self, tick_current: i32) -> RangeBand {
        if tick_current < self.tick_lower_index {
            RangeBand::Below
        } else if tick_current < self.tick_upper_index {
            RangeBand::InRange
        } else {
            RangeBand::Above
        }
    }

    /// How a keeper puts vaulted funds back. The tick must be inside the in-thresholds and
    /// either inside the range or on the vaulted side of it.
    pub fn redeploy_plan(&self, tick_current: i32) -> Result<Redeploy> {
        let side = self.vaulted_side()?;
        let thresholds = self.thresholds();
        require!(
            tick_current >= thresholds.lower_in && tick_current <= thresholds.upper_in,
            StrategyError::TickNotWithinRange
        );
        match self.band(tick_current) {
            RangeBand::InRange => Ok(Redeploy::Liquidity { side, liquidity: self.liquidity }),
            band if band == side.home_band() => Ok(Redeploy::SingleSided(side)),
            _ => err!(StrategyError::TickNotWithinRange),
        }
    }

    /// How a closing user gets vaulted funds back. Never fails on tick position:
    /// single-sided redeploy where the market accepts it, otherwise a direct payout.
    pub fn close_plan(&self, tick_current: i32) -> Result<Redeploy> {
        let side = self.vaulted_side()?;
        if self.band(tick_current) == side.home_band() {
            Ok(Redeploy::SingleSided(side))
        } else {
            Ok(Redeploy::Payout(side))
        }
    }

    pub fn mark_vaulted(
        &mut self,
        side: TokenSide,
        liquidity: u128,
        amount_deposited: u64,
        lp_amount: u64,
    ) -> Result<()> {
        require!(self.state == PositionState::Deployed, StrategyError::PositionDeployed);
        require!(amount_deposited > 0, StrategyError::InsufficientLiquidity);
        require!(lp_amount > 0, StrategyError::SlippageExceeded);
        self.liquidity = liquidity;
        self.amount_deposited_into_vault = amount_deposited;
        self.lp_amount = lp_amount;
        self.state = PositionState::Vaulted(side);
        Ok(())
    }

    pub fn mark_deployed(&mut self) {
        self.liquidity = 0;
        self.amount_deposited_into_vault = 0;
        self.lp_amount = 0;
        self.state = PositionState::Deployed;
    }

    pub fn require_owner(&self, caller: &Pubkey) -> Result<()> {
        require_keys_eq!(*caller, self.user, StrategyError::UnauthorizedUser);
        Ok(())
    }

    /// Vault fields are all zero exactly when liquidity is deployed.
    #[cfg(test)]
    pub fn is_consistent(&self) -> bool {
        match self.state {
            PositionState::Deployed => {
                self.amount_deposited_into_vault == 0 && self.lp_amount == 0 && self.liquidity == 0
            }
            PositionState::Vaulted(_) => self.amount_deposited_into_vault > 0 && self.lp_amount > 0,
        }
    }
}

/// Inclusive minimum-out check.
pub fn check_slippage(actual: u64, minimum: u64) -> Result<()> {
    require_gte!(actual, minimum, StrategyError::SlippageExceeded);
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::integer_arithmetic)]
mod tests {
    use super::*;
    use anchor_lang::error::Error;

    fn config() -> GlobalConfig {
        GlobalConfig {
            admin: Pubkey::new_unique(),
            enabled_actions: ActionSet::all(),
            credits_for_decrease: 3,
            credits_for_increase: 2,
            sol_per_credit: 1_000_000,
            base_deposit: 10_000_000,
            fee_basis_points: 1_000,
            sol_treasury: Pubkey::new_unique(),
            config_version: 0,
            bump: 255,
            treasury_bump: 254,
        }
    }

    fn record() -> UserPositionRecord {
        UserPositionRecord {
            user: Pubkey::new_unique(),
            nft_mint: Pubkey::new_unique(),
            nft_token_program: anchor_spl::token::ID,
            pool: Pubkey::new_unique(),
            personal_position: Pubkey::new_unique(),
            tick_lower_index: -100,
            tick_upper_index: 100,
            tick_lower_out_threshold: -300,
            tick_upper_out_threshold: 300,
            tick_lower_in_threshold: -200,
            tick_upper_in_threshold: 200,
            liquidity: 0,
            amount_deposited_into_vault: 0,
            lp_amount: 0,
            state: PositionState::Deployed,
            bump: 250,
        }
    }

    fn keeper() -> KeeperAccount {
        KeeperAccount { keeper: Pubkey::new_unique(), credits: 0, bump: 253 }
    }

    /// Share-conserving holding vault: shares are minted pro rata to the pool balance.
    struct VaultModel {
        total_amount: u64,
        total_shares: u64,
    }

    impl VaultModel {
        fn deposit(&mut self, amount: u64) -> u64 {
            let shares = if self.total_shares == 0 {
                amount
            } else {
                (amount as u128 * self.total_shares as u128 / self.total_amount as u128) as u64
            };
            self.total_amount += amount;
            self.total_shares += shares;
            shares
        }

        fn withdraw(&mut self, shares: u64) -> u64 {
            let amount = (shares as u128 * self.total_amount as u128 / self.total_shares as u128) as u64;
            self.total_amount -= amount;
            self.total_shares -= shares;
            amount
        }

        fn accrue(&mut self, yield_amount: u64) {
            self.total_amount += yield_amount;
        }
    }

    #[test]
    fn test_action_set_toggles_independently() {
        let set = ActionSet::empty().with(Action::DecreasePosition, true);
        assert!(set.contains(Action::DecreasePosition));
        assert!(!set.contains(Action::CreatePosition));
        assert!(!set.contains(Action::IncreasePosition));

        let set = ActionSet::all().with(Action::CreatePosition, false);
        assert!(!set.contains(Action::CreatePosition));
        assert!(set.contains(Action::IncreasePosition));
        assert!(set.contains(Action::DecreasePosition));
        assert_eq!(set.with(Action::CreatePosition, true), ActionSet::all());
    }

    #[test]
    fn test_require_action_errors() {
        let mut cfg = config();
        cfg.enabled_actions = ActionSet::empty();
        assert_eq!(cfg.require_action(Action::CreatePosition).unwrap_err(), Error::from(StrategyError::NotOpen));
        assert_eq!(
            cfg.require_action(Action::IncreasePosition).unwrap_err(),
            Error::from(StrategyError::UnauthorizedAction)
        );
        assert_eq!(
            cfg.require_action(Action::DecreasePosition).unwrap_err(),
            Error::from(StrategyError::UnauthorizedAction)
        );
        cfg.enabled_actions = ActionSet::all();
        assert!(cfg.require_action(Action::CreatePosition).is_ok());
    }

    #[test]
    fn test_admin_and_keeper_identity() {
        let cfg = config();
        assert!(cfg.require_admin(&cfg.admin).is_ok());
        assert_eq!(
            cfg.require_admin(&Pubkey::new_unique()).unwrap_err(),
            Error::from(StrategyError::UnauthorizedAdmin)
        );

        let k = keeper();
        assert!(k.require_keeper(&k.keeper).is_ok());
        assert_eq!(
            k.require_keeper(&Pubkey::new_unique()).unwrap_err(),
            Error::from(StrategyError::UnauthorizedKeeper)
        );
    }

    #[test]
    fn test_config_change_bumps_version() {
        let mut cfg = config();
        let new_admin = Pubkey::new_unique();
        cfg.apply_change(&ConfigChange::Admin(new_admin)).unwrap();
        cfg.apply_change(&ConfigChange::SolPerCredit(42)).unwrap();
        cfg.apply_change(&ConfigChange::Action { action: Action::IncreasePosition, enabled: false })
            .unwrap();
        assert_eq!(cfg.admin, new_admin);
        assert_eq!(cfg.sol_per_credit, 42);
        assert!(!cfg.enabled_actions.contains(Action::IncreasePosition));
        assert_eq!(cfg.config_version, 3);
    }

    #[test]
    fn test_fee_cap_rejected_without_side_effects() {
        let mut cfg = config();
        assert!(cfg.apply_change(&ConfigChange::FeeBasisPoints(10_000)).is_ok());
        let err = cfg.apply_change(&ConfigChange::FeeBasisPoints(10_001)).unwrap_err();
        assert_eq!(err, Error::from(StrategyError::FeeTooHigh));
        assert_eq!(cfg.fee_basis_points, 10_000);
        assert_eq!(cfg.config_version, 1);
        assert_eq!(ConfigChange::FeeBasisPoints(1).field(), "fee_basis_points");
    }

    #[test]
    fn test_threshold_ordering() {
        let ok = TickThresholds { lower_out: -300, lower_in: -200, upper_in: 200, upper_out: 300 };
        assert!(ok.validate(-100, 100).is_ok());

        // in and out may coincide
        let flush = TickThresholds { lower_out: -200, lower_in: -200, upper_in: 200, upper_out: 200 };
        assert!(flush.validate(-100, 100).is_ok());

        let bad = [
            TickThresholds { lower_out: -100, lower_in: -200, upper_in: 200, upper_out: 300 },
            TickThresholds { lower_out: -300, lower_in: -100, upper_in: 200, upper_out: 300 },
            TickThresholds { lower_out: -300, lower_in: -200, upper_in: 100, upper_out: 300 },
            TickThresholds { lower_out: -300, lower_in: -200, upper_in: 200, upper_out: 199 },
        ];
        for t in bad {
            assert_eq!(t.validate(-100, 100).unwrap_err(), Error::from(StrategyError::InvalidTickThresholds));
        }
        assert_eq!(ok.validate(50, 50).unwrap_err(), Error::from(StrategyError::InvalidTickThresholds));
    }

    #[test]
    fn test_decrease_side_needs_strictly_outside() {
        let rec = record();
        assert_eq!(rec.decrease_side(-301).unwrap(), TokenSide::Token0);
        assert_eq!(rec.decrease_side(301).unwrap(), TokenSide::Token1);
        for tick in [-300, 0, 300] {
            assert_eq!(rec.decrease_side(tick).unwrap_err(), Error::from(StrategyError::TickNotOutOfRange));
        }
    }

    #[test]
    fn test_range_bands_follow_market_math() {
        let rec = record(); // [-100, 100)
        assert_eq!(rec.band(-101), RangeBand::Below);
        assert_eq!(rec.band(-100), RangeBand::InRange);
        assert_eq!(rec.band(99), RangeBand::InRange);
        // the upper tick itself holds only token1
        assert_eq!(rec.band(100), RangeBand::Above);
    }

    #[test]
    fn test_redeploy_plan_needs_vaulted_state() {
        let rec = record();
        assert_eq!(rec.redeploy_plan(0).unwrap_err(), Error::from(StrategyError::PositionNotDeployed));
        assert_eq!(rec.close_plan(0).unwrap_err(), Error::from(StrategyError::PositionNotDeployed));
    }

    #[test]
    fn test_redeploy_plan_same_side_band_is_single_sided() {
        let mut rec = record(); // range [-100, 100), in-thresholds [-200, 200]
        rec.mark_vaulted(TokenSide::Token0, 500, 1_000, 900).unwrap();
        assert_eq!(rec.redeploy_plan(-200).unwrap(), Redeploy::SingleSided(TokenSide::Token0));
        assert_eq!(rec.redeploy_plan(-101).unwrap(), Redeploy::SingleSided(TokenSide::Token0));
        assert_eq!(rec.redeploy_plan(-201).unwrap_err(), Error::from(StrategyError::TickNotWithinRange));

        let mut rec = record();
        rec.mark_vaulted(TokenSide::Token1, 500, 1_000, 900).unwrap();
        assert_eq!(rec.redeploy_plan(100).unwrap(), Redeploy::SingleSided(TokenSide::Token1));
        assert_eq!(rec.redeploy_plan(200).unwrap(), Redeploy::SingleSided(TokenSide::Token1));
        assert_eq!(rec.redeploy_plan(201).unwrap_err(), Error::from(StrategyError::TickNotWithinRange));
    }

    #[test]
    fn test_redeploy_plan_in_range_restores_recorded_liquidity() {
        let mut rec = record();
        rec.mark_vaulted(TokenSide::Token0, 500, 1_000, 900).unwrap();
        for tick in [-100, 0, 99] {
            assert_eq!(
                rec.redeploy_plan(tick).unwrap(),
                Redeploy::Liquidity { side: TokenSide::Token0, liquidity: 500 }
            );
        }
    }

    #[test]
    fn test_redeploy_plan_rejects_far_side() {
        // token0 cannot be deposited alone once the tick is at or above the range
        let mut rec = record();
        rec.mark_vaulted(TokenSide::Token0, 500, 1_000, 900).unwrap();
        for tick in [100, 150, 200] {
            assert_eq!(rec.redeploy_plan(tick).unwrap_err(), Error::from(StrategyError::TickNotWithinRange));
        }

        let mut rec = record();
        rec.mark_vaulted(TokenSide::Token1, 500, 1_000, 900).unwrap();
        for tick in [-200, -150, -101] {
            assert_eq!(rec.redeploy_plan(tick).unwrap_err(), Error::from(StrategyError::TickNotWithinRange));
        }
    }

    #[test]
    fn test_close_plan_always_has_an_exit() {
        let mut rec = record();
        rec.mark_vaulted(TokenSide::Token0, 500, 1_000, 900).unwrap();
        assert_eq!(rec.close_plan(-5_000).unwrap(), Redeploy::SingleSided(TokenSide::Token0));
        assert_eq!(rec.close_plan(-101).unwrap(), Redeploy::SingleSided(TokenSide::Token0));
        assert_eq!(rec.close_plan(0).unwrap(), Redeploy::Payout(TokenSide::Token0));
        assert_eq!(rec.close_plan(150).unwrap(), Redeploy::Payout(TokenSide::Token0));
        assert_eq!(rec.close_plan(5_000).unwrap(), Redeploy::Payout(TokenSide::Token0));

        let mut rec = record();
        rec.mark_vaulted(TokenSide::Token1, 500, 1_000, 900).unwrap();
        assert_eq!(rec.close_plan(100).unwrap(), Redeploy::SingleSided(TokenSide::Token1));
        assert_eq!(rec.close_plan(-150).unwrap(), Redeploy::Payout(TokenSide::Token1));
    }

    #[test]
    fn test_increase_credits_halved_in_range() {
        let cfg = config(); // 2 per increase
        assert_eq!(cfg.increase_credits(&Redeploy::SingleSided(TokenSide::Token0)), 2);
        assert_eq!(cfg.increase_credits(&Redeploy::Liquidity { side: TokenSide::Token1, liquidity: 9 }), 1);

        let mut odd = config();
        odd.credits_for_increase = 3;
        assert_eq!(odd.increase_credits(&Redeploy::Liquidity { side: TokenSide::Token0, liquidity: 9 }), 1);
    }

    #[test]
    fn test_token_side_pairs() {
        assert_eq!(TokenSide::Token0.pair(5, 7), (5, 7));
        assert_eq!(TokenSide::Token1.pair(5, 7), (7, 5));
        assert_eq!(TokenSide::Token1.split(5), (0, 5));
        assert_eq!(TokenSide::Token0.other(), TokenSide::Token1);
        assert_eq!(Redeploy::Payout(TokenSide::Token1).side(), TokenSide::Token1);
    }

    #[test]
    fn test_second_decrease_fails_and_leaves_record() {
        let mut rec = record();
        rec.mark_vaulted(TokenSide::Token0, 777, 1_000, 1_000).unwrap();
        let snapshot = (rec.liquidity, rec.amount_deposited_into_vault, rec.lp_amount, rec.state);

        assert_eq!(rec.decrease_side(-400).unwrap_err(), Error::from(StrategyError::PositionDeployed));
        assert_eq!(
            rec.mark_vaulted(TokenSide::Token0, 1, 1, 1).unwrap_err(),
            Error::from(StrategyError::PositionDeployed)
        );
        assert_eq!(snapshot, (rec.liquidity, rec.amount_deposited_into_vault, rec.lp_amount, rec.state));
    }

    #[test]
    fn test_mark_vaulted_rejects_empty_amounts() {
        let mut rec = record();
        assert_eq!(
            rec.mark_vaulted(TokenSide::Token0, 10, 0, 10).unwrap_err(),
            Error::from(StrategyError::InsufficientLiquidity)
        );
        assert_eq!(
            rec.mark_vaulted(TokenSide::Token0, 10, 10, 0).unwrap_err(),
            Error::from(StrategyError::SlippageExceeded)
        );
        assert!(rec.is_consistent());
        assert_eq!(rec.state, PositionState::Deployed);
    }

    #[test]
    fn test_close_requires_owner_in_any_state() {
        let mut rec = record();
        assert_eq!(
            rec.require_owner(&Pubkey::new_unique()).unwrap_err(),
            Error::from(StrategyError::UnauthorizedUser)
        );
        let user = rec.user;
        assert!(rec.require_owner(&user).is_ok());
        rec.mark_vaulted(TokenSide::Token1, 1, 1, 1).unwrap();
        assert!(rec.require_owner(&user).is_ok());
    }

    #[test]
    fn test_split_withdrawal() {
        let cfg = config(); // 10%
        assert_eq!(cfg.split_withdrawal(1_000, 1_000).unwrap(), (1_000, 0));
        assert_eq!(cfg.split_withdrawal(1_000, 900).unwrap(), (900, 0));
        assert_eq!(cfg.split_withdrawal(1_000, 1_500).unwrap(), (1_450, 50));
        // rounding favours the user
        assert_eq!(cfg.split_withdrawal(1_000, 1_009).unwrap(), (1_009, 0));

        let mut all_fee = config();
        all_fee.fee_basis_points = ALL_BASIS_POINTS;
        assert_eq!(all_fee.split_withdrawal(100, u64::MAX).unwrap(), (100, u64::MAX - 100));
    }

    #[test]
    fn test_redemption_payout() {
        let cfg = config();
        assert_eq!(cfg.redemption_payout(7).unwrap(), 7_000_000);

        let mut big = config();
        big.sol_per_credit = u64::MAX;
        assert_eq!(big.redemption_payout(1).unwrap(), u64::MAX);
        assert_eq!(big.redemption_payout(2).unwrap_err(), Error::from(StrategyError::Overflow));
    }

    #[test]
    fn test_keeper_credits() {
        let mut k = keeper();
        assert_eq!(k.take_credits().unwrap_err(), Error::from(StrategyError::InsufficientCredits));
        k.credit(3).unwrap();
        k.credit(2).unwrap();
        assert_eq!(k.take_credits().unwrap(), 5);
        assert_eq!(k.credits, 0);

        k.credits = u64::MAX;
        assert_eq!(k.credit(1).unwrap_err(), Error::from(StrategyError::Overflow));
        assert_eq!(k.credits, u64::MAX);
    }

    #[test]
    fn test_treasury_rent_floor() {
        assert!(SolTreasury::check_withdrawal(10_000, 1_000, 9_000).is_ok());
        assert_eq!(
            SolTreasury::check_withdrawal(10_000, 1_000, 9_001).unwrap_err(),
            Error::from(StrategyError::InsufficientTreasury)
        );
        assert_eq!(
            SolTreasury::check_withdrawal(500, 1_000, 1).unwrap_err(),
            Error::from(StrategyError::InsufficientTreasury)
        );
    }

    #[test]
    fn test_slippage_is_inclusive() {
        assert!(check_slippage(100, 100).is_ok());
        assert_eq!(check_slippage(99, 100).unwrap_err(), Error::from(StrategyError::SlippageExceeded));
    }

    #[test]
    fn test_full_cycle_against_vault_model() {
        let cfg = config();
        let mut rec = record();
        let mut k = keeper();
        let mut vault = VaultModel { total_amount: 50_000, total_shares: 50_000 };

        // price drops through the lower out-threshold
        let side = rec.decrease_side(-350).unwrap();
        assert_eq!(side, TokenSide::Token0);
        let removed = 20_000u64;
        let lp = vault.deposit(removed);
        check_slippage(lp, 19_000).unwrap();
        rec.mark_vaulted(side, 123_456, removed, lp).unwrap();
        k.credit(cfg.credits_for_decrease).unwrap();
        assert!(rec.is_consistent());

        // vault earns 10%
        vault.accrue(7_000);

        // price comes back inside the in-thresholds
        let plan = rec.redeploy_plan(-150).unwrap();
        assert_eq!(plan, Redeploy::SingleSided(TokenSide::Token0));
        let side = plan.side();
        let withdrawn = vault.withdraw(rec.lp_amount);
        assert_eq!(withdrawn, 22_000);
        let (redeploy, fee) = cfg.split_withdrawal(rec.amount_deposited_into_vault, withdrawn).unwrap();
        assert_eq!((redeploy, fee), (21_800, 200));
        check_slippage(redeploy, 21_000).unwrap();
        assert_eq!(side.split(redeploy), (21_800, 0));
        assert!(side.base_flag());
        rec.mark_deployed();
        k.credit(cfg.increase_credits(&plan)).unwrap();

        assert!(rec.is_consistent());
        assert_eq!(rec.state, PositionState::Deployed);
        assert_eq!(k.credits, 5);

        let payout = cfg.redemption_payout(k.take_credits().unwrap()).unwrap();
        assert_eq!(payout, 5_000_000);
        assert_eq!(k.credits, 0);

        let user = rec.user;
        assert!(rec.require_owner(&user).is_ok());
    }

    #[test]
    fn test_drop_then_rally_into_range() {
        let cfg = config();
        let mut rec = record();
        let mut k = keeper();
        let mut vault = VaultModel { total_amount: 10_000, total_shares: 10_000 };

        let side = rec.decrease_side(-400).unwrap();
        let lp = vault.deposit(4_000);
        rec.mark_vaulted(side, 900, 4_000, lp).unwrap();
        k.credit(cfg.credits_for_decrease).unwrap();

        // price jumps straight back inside [-100, 100)
        let plan = rec.redeploy_plan(10).unwrap();
        assert_eq!(plan, Redeploy::Liquidity { side: TokenSide::Token0, liquidity: 900 });
        let withdrawn = vault.withdraw(rec.lp_amount);
        let (redeploy, fee) = cfg.split_withdrawal(rec.amount_deposited_into_vault, withdrawn).unwrap();
        assert_eq!((redeploy, fee), (4_000, 0));
        rec.mark_deployed();
        k.credit(cfg.increase_credits(&plan)).unwrap();

        assert!(rec.is_consistent());
        assert_eq!(k.credits, 3 + 1);
    }

    #[test]
    fn test_close_while_vaulted_pays_out_on_far_side() {
        let cfg = config();
        let mut rec = record();
        let mut vault = VaultModel { total_amount: 10_000, total_shares: 10_000 };

        let side = rec.decrease_side(-400).unwrap();
        let lp = vault.deposit(4_000);
        rec.mark_vaulted(side, 900, 4_000, lp).unwrap();
        vault.accrue(1_400); // 10% on the 14_000 pool

        // price rallied past the range: token0 cannot go back into the market alone
        let user = rec.user;
        rec.require_owner(&user).unwrap();
        assert_eq!(rec.close_plan(400).unwrap(), Redeploy::Payout(TokenSide::Token0));
        let withdrawn = vault.withdraw(rec.lp_amount);
        assert_eq!(withdrawn, 4_400);
        let (payout, fee) = cfg.split_withdrawal(rec.amount_deposited_into_vault, withdrawn).unwrap();
        assert_eq!((payout, fee), (4_360, 40));
        rec.mark_deployed();
        assert!(rec.is_consistent());
    }
}
