// account_integrity.rs
//
// Keeper instructions receive every CLMM and vault account through
// remaining_accounts. Each slot has a declared role; the expected address of
// every role is recomputed from the global state, the user record and the
// validated pool, and any mismatch aborts before a single CPI runs.

use anchor_lang::prelude::*;
use anchor_spl::associated_token::{
    get_associated_token_address, get_associated_token_address_with_program_id,
};

use crate::meteora_vault_cpi::{lp_mint_pda, token_vault_pda, vault_pda, METEORA_VAULT_PROGRAM_ID};
use crate::raydium_clmm_cpi::{
    bitmap_extension_pda, personal_position_pda, protocol_position_pda, tick_array_pda,
    tick_array_start_index, PersonalPositionSnapshot, PoolSnapshot, RAYDIUM_CLMM_PROGRAM_ID,
    REWARD_GROUP_LEN, SPL_MEMO_PROGRAM_ID, TOKEN_2022_PROGRAM_ID,
};
use crate::{StrategyError, TokenSide};

/// Raydium pools carry at most three reward streams.
pub const MAX_REWARD_GROUPS: usize = 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    // holding vault
    VaultProgram,
    Vault,
    VaultTokenVault,
    VaultLpMint,
    TreasuryDepositToken,
    TreasuryLpToken,
    GlobalState,
    TokenProgram,
    // CLMM market
    ClmmProgram,
    UserState,
    PositionNftAccount,
    PersonalPosition,
    Pool,
    ProtocolPosition,
    PoolVault0,
    PoolVault1,
    TickArrayLower,
    TickArrayUpper,
    TreasuryToken0,
    TreasuryToken1,
    Token2022Program,
    MemoProgram,
    Mint0,
    Mint1,
}

// ============ LAYOUTS ============

pub const VAULT_ROLES: [Role; 8] = [
    Role::VaultProgram,
    Role::Vault,
    Role::VaultTokenVault,
    Role::VaultLpMint,
    Role::TreasuryDepositToken,
    Role::TreasuryLpToken,
    Role::GlobalState,
    Role::TokenProgram,
];

pub const DECREASE_ROLES: [Role; 17] = [
    Role::ClmmProgram,
    Role::UserState,
    Role::PositionNftAccount,
    Role::PersonalPosition,
    Role::Pool,
    Role::ProtocolPosition,
    Role::PoolVault0,
    Role::PoolVault1,
    Role::TickArrayLower,
    Role::TickArrayUpper,
    Role::TreasuryToken0,
    Role::TreasuryToken1,
    Role::TokenProgram,
    Role::Token2022Program,
    Role::MemoProgram,
    Role::Mint0,
    Role::Mint1,
];

pub const INCREASE_ROLES: [Role; 16] = [
    Role::ClmmProgram,
    Role::GlobalState,
    Role::PositionNftAccount,
    Role::Pool,
    Role::ProtocolPosition,
    Role::PersonalPosition,
    Role::TickArrayLower,
    Role::TickArrayUpper,
    Role::TreasuryToken0,
    Role::TreasuryToken1,
    Role::PoolVault0,
    Role::PoolVault1,
    Role::TokenProgram,
    Role::Token2022Program,
    Role::Mint0,
    Role::Mint1,
];

/// Slot indices inside `VAULT_ROLES`.
pub mod vault_slot {
    pub const TREASURY_DEPOSIT_TOKEN: usize = 4;
    pub const TREASURY_LP_TOKEN: usize = 5;
    pub const TOKEN_PROGRAM: usize = 7;
}

/// Slot indices inside `DECREASE_ROLES`.
pub mod decrease_slot {
    pub const POOL: usize = 4;
    pub const TREASURY_TOKEN_0: usize = 10;
    pub const TREASURY_TOKEN_1: usize = 11;
}

/// Slot indices inside `INCREASE_ROLES`.
pub mod increase_slot {
    pub const GLOBAL_STATE: usize = 1;
    pub const POSITION_NFT_ACCOUNT: usize = 2;
    pub const POOL: usize = 3;
    pub const TREASURY_TOKEN_0: usize = 8;
    pub const TREASURY_TOKEN_1: usize = 9;
    pub const TOKEN_PROGRAM: usize = 12;
    pub const TOKEN_PROGRAM_2022: usize = 13;
}

// ============ DERIVATION ============

/// Everything the expected addresses are derived from.
#[derive(Clone, Copy, Debug)]
pub struct DerivationContext {
    pub global_state: Pubkey,
    pub user_state: Pubkey,
    pub nft_mint: Pubkey,
    pub nft_token_program: Pubkey,
    pub personal_position: Pubkey,
    pub tick_lower_index: i32,
    pub tick_upper_index: i32,
    pub pool: PoolSnapshot,
    pub vault_side: TokenSide,
}

/// Expected address of every role, derived once per instruction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExpectedAccounts {
    vault: Pubkey,
    vault_token_vault: Pubkey,
    vault_lp_mint: Pubkey,
    treasury_lp_token: Pubkey,
    treasury_token_0: Pubkey,
    treasury_token_1: Pubkey,
    position_nft_account: Pubkey,
    protocol_position: Pubkey,
    tick_array_lower: Pubkey,
    tick_array_upper: Pubkey,
    vault_side: TokenSide,
    global_state: Pubkey,
    user_state: Pubkey,
    personal_position: Pubkey,
    pool: PoolSnapshot,
}

impl ExpectedAccounts {
    pub fn derive(ctx: &DerivationContext) -> Result<Self> {
        let pool = ctx.pool;
        let (vault, _) = vault_pda(&pool.mint(ctx.vault_side));
        let (vault_lp_mint, _) = lp_mint_pda(&vault);

        let lower_start = tick_array_start_index(ctx.tick_lower_index, pool.tick_spacing)
            .ok_or(StrategyError::Overflow)?;
        let upper_start = tick_array_start_index(ctx.tick_upper_index, pool.tick_spacing)
            .ok_or(StrategyError::Overflow)?;

        Ok(Self {
            vault,
            vault_token_vault: token_vault_pda(&vault).0,
            vault_lp_mint,
            treasury_lp_token: get_associated_token_address(&ctx.global_state, &vault_lp_mint),
            treasury_token_0: get_associated_token_address(&ctx.global_state, &pool.token_mint_0),
            treasury_token_1: get_associated_token_address(&ctx.global_state, &pool.token_mint_1),
            position_nft_account: get_associated_token_address_with_program_id(
                &ctx.user_state,
                &ctx.nft_mint,
                &ctx.nft_token_program,
            ),
            protocol_position: protocol_position_pda(
                &pool.key,
                ctx.tick_lower_index,
                ctx.tick_upper_index,
            )
            .0,
            tick_array_lower: tick_array_pda(&pool.key, lower_start).0,
            tick_array_upper: tick_array_pda(&pool.key, upper_start).0,
            vault_side: ctx.vault_side,
            global_state: ctx.global_state,
            user_state: ctx.user_state,
            personal_position: ctx.personal_position,
            pool,
        })
    }

    pub fn treasury_token(&self, side: TokenSide) -> Pubkey {
        match side {
            TokenSide::Token0 => self.treasury_token_0,
            TokenSide::Token1 => self.treasury_token_1,
        }
    }

    /// Expected address for `role` and the error raised when the supplied one differs.
    pub fn key_for(&self, role: Role) -> (Pubkey, StrategyError) {
        use StrategyError::*;
        match role {
            Role::VaultProgram => (METEORA_VAULT_PROGRAM_ID, InvalidProgram),
            Role::Vault => (self.vault, InvalidTokenAccount),
            Role::VaultTokenVault => (self.vault_token_vault, InvalidTokenAccount),
            Role::VaultLpMint => (self.vault_lp_mint, InvalidTokenAccount),
            Role::TreasuryDepositToken => (self.treasury_token(self.vault_side), InvalidTokenAccount),
            Role::TreasuryLpToken => (self.treasury_lp_token, InvalidTokenAccount),
            Role::GlobalState => (self.global_state, InvalidGlobalState),
            Role::TokenProgram => (anchor_spl::token::ID, InvalidProgram),
            Role::ClmmProgram => (RAYDIUM_CLMM_PROGRAM_ID, InvalidProgram),
            Role::UserState => (self.user_state, InvalidUserState),
            Role::PositionNftAccount => (self.position_nft_account, InvalidNftMint),
            Role::PersonalPosition => (self.personal_position, InvalidNftMint),
            Role::Pool => (self.pool.key, InvalidPool),
            Role::ProtocolPosition => (self.protocol_position, InvalidTokenAccount),
            Role::PoolVault0 => (self.pool.token_vault_0, InvalidTokenAccount),
            Role::PoolVault1 => (self.pool.token_vault_1, InvalidTokenAccount),
            Role::TickArrayLower => (self.tick_array_lower, InvalidTokenAccount),
            Role::TickArrayUpper => (self.tick_array_upper, InvalidTokenAccount),
            Role::TreasuryToken0 => (self.treasury_token_0, InvalidTokenAccount),
            Role::TreasuryToken1 => (self.treasury_token_1, InvalidTokenAccount),
            Role::Token2022Program => (TOKEN_2022_PROGRAM_ID, InvalidProgram),
            Role::MemoProgram => (SPL_MEMO_PROGRAM_ID, InvalidProgram),
            Role::Mint0 => (self.pool.token_mint_0, InvalidTokenAccount),
            Role::Mint1 => (self.pool.token_mint_1, InvalidTokenAccount),
        }
    }
}

/// Checks `supplied` slot by slot against the concatenated `layout`.
/// Returns the number of fixed slots consumed; anything after them is trailing.
pub fn validate_roles(
    layout: &[&[Role]],
    supplied: &[Pubkey],
    ctx: &DerivationContext,
) -> Result<usize> {
    let fixed: usize = layout.iter().map(|roles| roles.len()).sum();
    require!(supplied.len() >= fixed, StrategyError::MissingAccounts);

    let expected = ExpectedAccounts::derive(ctx)?;
    let roles = layout.iter().flat_map(|roles| roles.iter());
    for (role, key) in roles.zip(supplied) {
        let (want, err) = expected.key_for(*role);
        require_keys_eq!(*key, want, err);
    }
    Ok(fixed)
}

// ============ REGISTRATION ============

/// What `register_position` was handed, read before anything is written.
#[derive(Clone, Copy, Debug)]
pub struct RegistrationAccounts {
    pub personal_position: Pubkey,
    pub position: PersonalPositionSnapshot,
    pub nft_mint: Pubkey,
    pub nft_decimals: u8,
    pub nft_supply: u64,
    pub pool: Pubkey,
}

/// The position account must be the CLMM PDA of this NFT, the NFT a true 1-of-1,
/// and the pool the one the position lives in.
pub fn validate_registration(accounts: &RegistrationAccounts) -> Result<()> {
    let (expected_position, _) = personal_position_pda(&accounts.nft_mint);
    require_keys_eq!(accounts.personal_position, expected_position, StrategyError::InvalidNftMint);
    require_keys_eq!(accounts.position.nft_mint, accounts.nft_mint, StrategyError::InvalidNftMint);
    require!(
        accounts.nft_decimals == 0 && accounts.nft_supply == 1,
        StrategyError::InvalidNftMint
    );
    require_keys_eq!(accounts.pool, accounts.position.pool_id, StrategyError::InvalidPool);
    Ok(())
}

// ============ TRAILING ACCOUNTS ============

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrailingPolicy {
    BitmapOnly,
    BitmapAndRewards,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TrailingAccounts {
    pub has_bitmap_extension: bool,
    pub reward_groups: usize,
}

impl TrailingAccounts {
    /// Offset of the first reward triple inside the trailing slice.
    pub fn reward_offset(&self) -> usize {
        usize::from(self.has_bitmap_extension)
    }
}

/// The bitmap extension may lead; reward triples may follow when the policy allows.
pub fn validate_trailing(
    trailing: &[Pubkey],
    pool: &Pubkey,
    policy: TrailingPolicy,
) -> Result<TrailingAccounts> {
    let (bitmap_extension, _) = bitmap_extension_pda(pool);
    let has_bitmap_extension = trailing.first() == Some(&bitmap_extension);
    let rest = if has_bitmap_extension { &trailing[1..] } else { trailing };

    let reward_groups = match policy {
        TrailingPolicy::BitmapOnly => {
            require!(rest.is_empty(), StrategyError::UnexpectedAccount);
            0
        }
        TrailingPolicy::BitmapAndRewards => {
            let groups = rest.chunks_exact(REWARD_GROUP_LEN);
            require!(groups.remainder().is_empty(), StrategyError::UnexpectedAccount);
            let count = groups.len();
            require!(count <= MAX_REWARD_GROUPS, StrategyError::UnexpectedAccount);
            count
        }
    };
    Ok(TrailingAccounts { has_bitmap_extension, reward_groups })
}
