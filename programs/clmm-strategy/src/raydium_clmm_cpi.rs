// raydium_clmm_cpi.rs
//
// Raydium CLMM CPI module for clmm-strategy
// Program: CAMMCzo5YL8w4VFF8KVHrK22GGUsp5VTaW7grrKgrWqK (devnet: devi51mZmdwUJGU9hjN27vEz64Gps7uUefqxg27EAtH)
//
// Only the two V2 liquidity instructions are wrapped. Pool and personal position
// state are read at fixed offsets instead of pulling in the full CLMM crate.
//
// Discriminators verified as SHA256("global:<ix>")[0..8] / SHA256("account:<T>")[0..8].

use anchor_lang::prelude::*;
use anchor_lang::solana_program;
use anchor_lang::solana_program::{
    instruction::{AccountMeta, Instruction},
    program::invoke_signed,
};
use core::ops::Range;

use crate::{StrategyError, TokenSide};

// ═══════════════════════════════════════════════════════════════════════════
// PROGRAM ID & CONSTANTS
// ═══════════════════════════════════════════════════════════════════════════

#[cfg(not(feature = "devnet"))]
pub const RAYDIUM_CLMM_PROGRAM_ID: Pubkey =
    solana_program::pubkey!("CAMMCzo5YL8w4VFF8KVHrK22GGUsp5VTaW7grrKgrWqK");

#[cfg(feature = "devnet")]
pub const RAYDIUM_CLMM_PROGRAM_ID: Pubkey =
    solana_program::pubkey!("devi51mZmdwUJGU9hjN27vEz64Gps7uUefqxg27EAtH");

pub const SPL_MEMO_PROGRAM_ID: Pubkey =
    solana_program::pubkey!("MemoSq4gqABAXKb96qnH8TysNcWxMyWCqXgDLGmfcHr");

pub const TOKEN_2022_PROGRAM_ID: Pubkey =
    solana_program::pubkey!("TokenzQdBNbLqP5VEhdkAS6EPFLC1PHnBqCXEpPxuEb");

pub const TICK_ARRAY_SIZE: i32 = 60;

/// Fixed accounts of decrease_liquidity_v2, program account included.
pub const DECREASE_LIQUIDITY_V2_ACCOUNTS: usize = 16 + 1;

/// Fixed accounts of increase_liquidity_v2, program account included.
pub const INCREASE_LIQUIDITY_V2_ACCOUNTS: usize = 15 + 1;

/// Reward accounts trail the fixed list as (reward_vault, recipient, reward_mint).
pub const REWARD_GROUP_LEN: usize = 3;

pub const POSITION_SEED: &[u8] = b"position";
pub const TICK_ARRAY_SEED: &[u8] = b"tick_array";
pub const BITMAP_EXTENSION_SEED: &[u8] = b"pool_tick_array_bitmap_extension";

// ═══════════════════════════════════════════════════════════════════════════
// DISCRIMINATORS
// ═══════════════════════════════════════════════════════════════════════════

pub mod disc {
    pub const DECREASE_LIQUIDITY_V2: [u8; 8]  = [0x3a, 0x7f, 0xbc, 0x3e, 0x4f, 0x52, 0xc4, 0x60];
    pub const INCREASE_LIQUIDITY_V2: [u8; 8]  = [0x85, 0x1d, 0x59, 0xdf, 0x45, 0xee, 0xb0, 0x0a];
    pub const POOL_STATE: [u8; 8]             = [0xf7, 0xed, 0xe3, 0xf5, 0xd7, 0xc3, 0xde, 0x46];
    pub const PERSONAL_POSITION_STATE: [u8; 8] = [0x46, 0x6f, 0x96, 0x7e, 0xe6, 0x0f, 0x19, 0x75];
}

// ═══════════════════════════════════════════════════════════════════════════
// ACCOUNT LAYOUTS
// ═══════════════════════════════════════════════════════════════════════════

// PoolState is zero-copy (packed), offsets include the 8-byte discriminator.
mod pool_layout {
    use core::ops::Range;
    pub const TOKEN_MINT_0: Range<usize> = 73..105;
    pub const TOKEN_MINT_1: Range<usize> = 105..137;
    pub const TOKEN_VAULT_0: Range<usize> = 137..169;
    pub const TOKEN_VAULT_1: Range<usize> = 169..201;
    pub const TICK_SPACING: Range<usize> = 235..237;
    pub const TICK_CURRENT: Range<usize> = 269..273;
}

// PersonalPositionState is borsh-serialized; fixed-size prefix only.
mod position_layout {
    use core::ops::Range;
    pub const NFT_MINT: Range<usize> = 9..41;
    pub const POOL_ID: Range<usize> = 41..73;
    pub const TICK_LOWER: Range<usize> = 73..77;
    pub const TICK_UPPER: Range<usize> = 77..81;
    pub const LIQUIDITY: Range<usize> = 81..97;
}

fn check_discriminator(data: &[u8], expected: &[u8; 8]) -> Result<()> {
    let tag = data.get(..8).ok_or(ErrorCode::AccountDiscriminatorNotFound)?;
    require!(tag == expected, ErrorCode::AccountDiscriminatorMismatch);
    Ok(())
}

fn read_pubkey(data: &[u8], range: Range<usize>, err: StrategyError) -> Result<Pubkey> {
    let bytes = data.get(range).ok_or(err)?;
    Ok(Pubkey::try_from(bytes).map_err(|_| err)?)
}

fn read_i32(data: &[u8], range: Range<usize>, err: StrategyError) -> Result<i32> {
    let bytes = data.get(range).ok_or(err)?;
    Ok(i32::from_le_bytes(bytes.try_into().map_err(|_| err)?))
}

/// The subset of CLMM pool state the strategy depends on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PoolSnapshot {
    pub key: Pubkey,
    pub token_mint_0: Pubkey,
    pub token_mint_1: Pubkey,
    pub token_vault_0: Pubkey,
    pub token_vault_1: Pubkey,
    pub tick_spacing: u16,
    pub tick_current: i32,
}

impl PoolSnapshot {
    pub fn load(account: &AccountInfo) -> Result<Self> {
        require_keys_eq!(*account.owner, RAYDIUM_CLMM_PROGRAM_ID, StrategyError::InvalidPool);
        let data = account.try_borrow_data()?;
        Self::parse(account.key(), &data)
    }

    pub fn parse(key: Pubkey, data: &[u8]) -> Result<Self> {
        check_discriminator(data, &disc::POOL_STATE)?;
        let err = StrategyError::InvalidPool;
        let spacing = data.get(pool_layout::TICK_SPACING).ok_or(err)?;
        let tick_spacing = u16::from_le_bytes(spacing.try_into().map_err(|_| err)?);
        require!(tick_spacing > 0, StrategyError::InvalidPool);
        Ok(Self {
            key,
            token_mint_0: read_pubkey(data, pool_layout::TOKEN_MINT_0, err)?,
            token_mint_1: read_pubkey(data, pool_layout::TOKEN_MINT_1, err)?,
            token_vault_0: read_pubkey(data, pool_layout::TOKEN_VAULT_0, err)?,
            token_vault_1: read_pubkey(data, pool_layout::TOKEN_VAULT_1, err)?,
            tick_spacing,
            tick_current: read_i32(data, pool_layout::TICK_CURRENT, err)?,
        })
    }

    pub fn mint(&self, side: TokenSide) -> Pubkey {
        match side {
            TokenSide::Token0 => self.token_mint_0,
            TokenSide::Token1 => self.token_mint_1,
        }
    }
}

/// The subset of a CLMM personal position the strategy depends on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PersonalPositionSnapshot {
    pub nft_mint: Pubkey,
    pub pool_id: Pubkey,
    pub tick_lower_index: i32,
    pub tick_upper_index: i32,
    pub liquidity: u128,
}

impl PersonalPositionSnapshot {
    pub fn load(account: &AccountInfo) -> Result<Self> {
        require_keys_eq!(*account.owner, RAYDIUM_CLMM_PROGRAM_ID, StrategyError::InvalidNftMint);
        let data = account.try_borrow_data()?;
        Self::parse(&data)
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        check_discriminator(data, &disc::PERSONAL_POSITION_STATE)?;
        let err = StrategyError::InvalidNftMint;
        let liquidity = data.get(position_layout::LIQUIDITY).ok_or(err)?;
        Ok(Self {
            nft_mint: read_pubkey(data, position_layout::NFT_MINT, err)?,
            pool_id: read_pubkey(data, position_layout::POOL_ID, err)?,
            tick_lower_index: read_i32(data, position_layout::TICK_LOWER, err)?,
            tick_upper_index: read_i32(data, position_layout::TICK_UPPER, err)?,
            liquidity: u128::from_le_bytes(liquidity.try_into().map_err(|_| err)?),
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// PDA HELPERS
// ═══════════════════════════════════════════════════════════════════════════

pub fn personal_position_pda(nft_mint: &Pubkey) -> (Pubkey, u8) {
    Pubkey::find_program_address(&[POSITION_SEED, nft_mint.as_ref()], &RAYDIUM_CLMM_PROGRAM_ID)
}

pub fn protocol_position_pda(pool: &Pubkey, tick_lower: i32, tick_upper: i32) -> (Pubkey, u8) {
    Pubkey::find_program_address(
        &[
            POSITION_SEED,
            pool.as_ref(),
            &tick_lower.to_be_bytes(),
            &tick_upper.to_be_bytes(),
        ],
        &RAYDIUM_CLMM_PROGRAM_ID,
    )
}

pub fn tick_array_pda(pool: &Pubkey, start_index: i32) -> (Pubkey, u8) {
    Pubkey::find_program_address(
        &[TICK_ARRAY_SEED, pool.as_ref(), &start_index.to_be_bytes()],
        &RAYDIUM_CLMM_PROGRAM_ID,
    )
}

pub fn bitmap_extension_pda(pool: &Pubkey) -> (Pubkey, u8) {
    Pubkey::find_program_address(&[BITMAP_EXTENSION_SEED, pool.as_ref()], &RAYDIUM_CLMM_PROGRAM_ID)
}

/// First tick of the tick array holding `tick`. Floors toward negative infinity.
pub fn tick_array_start_index(tick: i32, tick_spacing: u16) -> Option<i32> {
    let ticks_in_array = TICK_ARRAY_SIZE.checked_mul(i32::from(tick_spacing))?;
    tick.checked_div_euclid(ticks_in_array)?.checked_mul(ticks_in_array)
}

// ═══════════════════════════════════════════════════════════════════════════
// HELPERS
// ═══════════════════════════════════════════════════════════════════════════

fn trailing_meta(account: &AccountInfo) -> AccountMeta {
    if account.is_writable {
        AccountMeta::new(account.key(), false)
    } else {
        AccountMeta::new_readonly(account.key(), false)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// CPI INSTRUCTIONS
// ═══════════════════════════════════════════════════════════════════════════

/// Accounts: program, nft_owner(s), nft_account, personal_position(m), pool_state(m),
///   protocol_position(m), token_vault_0(m), token_vault_1(m), tick_array_lower(m),
///   tick_array_upper(m), recipient_0(m), recipient_1(m), token_program, token_program_2022,
///   memo_program, vault_0_mint, vault_1_mint
/// + remaining (bitmap extension, reward triples)
pub fn decrease_liquidity_v2<'info>(
    accounts: &[AccountInfo<'info>; DECREASE_LIQUIDITY_V2_ACCOUNTS],
    liquidity: u128,
    amount_0_min: u64,
    amount_1_min: u64,
    signer_seeds: &[&[&[u8]]],
    remaining_accounts: &[AccountInfo<'info>],
) -> Result<()> {
    let mut data = Vec::with_capacity(40);
    data.extend_from_slice(&disc::DECREASE_LIQUIDITY_V2);
    data.extend_from_slice(&liquidity.to_le_bytes());
    data.extend_from_slice(&amount_0_min.to_le_bytes());
    data.extend_from_slice(&amount_1_min.to_le_bytes());

    let mut metas = vec![
        AccountMeta::new_readonly(accounts[1].key(), true),    // nft_owner
        AccountMeta::new_readonly(accounts[2].key(), false),   // nft_account
        AccountMeta::new(accounts[3].key(), false),            // personal_position
        AccountMeta::new(accounts[4].key(), false),            // pool_state
        AccountMeta::new(accounts[5].key(), false),            // protocol_position
        AccountMeta::new(accounts[6].key(), false),            // token_vault_0
        AccountMeta::new(accounts[7].key(), false),            // token_vault_1
        AccountMeta::new(accounts[8].key(), false),            // tick_array_lower
        AccountMeta::new(accounts[9].key(), false),            // tick_array_upper
        AccountMeta::new(accounts[10].key(), false),           // recipient_0
        AccountMeta::new(accounts[11].key(), false),           // recipient_1
        AccountMeta::new_readonly(accounts[12].key(), false),  // token_program
        AccountMeta::new_readonly(accounts[13].key(), false),  // token_program_2022
        AccountMeta::new_readonly(accounts[14].key(), false),  // memo_program
        AccountMeta::new_readonly(accounts[15].key(), false),  // vault_0_mint
        AccountMeta::new_readonly(accounts[16].key(), false),  // vault_1_mint
    ];
    metas.extend(remaining_accounts.iter().map(trailing_meta));
    let mut all: Vec<AccountInfo<'info>> = accounts.to_vec();
    all.extend_from_slice(remaining_accounts);
    invoke_signed(&Instruction { program_id: RAYDIUM_CLMM_PROGRAM_ID, accounts: metas, data }, &all, signer_seeds)?;
    Ok(())
}

/// Single-sided deposits pass `base_flag` and a zero max on the other side.
/// Accounts: program, nft_owner(s), nft_account, pool_state(m), protocol_position(m),
///   personal_position(m), tick_array_lower(m), tick_array_upper(m), token_account_0(m),
///   token_account_1(m), token_vault_0(m), token_vault_1(m), token_program, token_program_2022,
///   vault_0_mint, vault_1_mint
/// + remaining (bitmap extension)
pub fn increase_liquidity_v2<'info>(
    accounts: &[AccountInfo<'info>; INCREASE_LIQUIDITY_V2_ACCOUNTS],
    liquidity: u128,
    amount_0_max: u64,
    amount_1_max: u64,
    base_flag: Option<bool>,
    signer_seeds: &[&[&[u8]]],
    remaining_accounts: &[AccountInfo<'info>],
) -> Result<()> {
    let mut data = Vec::with_capacity(42);
    data.extend_from_slice(&disc::INCREASE_LIQUIDITY_V2);
    data.extend_from_slice(&liquidity.to_le_bytes());
    data.extend_from_slice(&amount_0_max.to_le_bytes());
    data.extend_from_slice(&amount_1_max.to_le_bytes());
    match base_flag {
        None => data.push(0),
        Some(flag) => {
            data.push(1);
            data.push(u8::from(flag));
        }
    }

    let mut metas = vec![
        AccountMeta::new_readonly(accounts[1].key(), true),    // nft_owner
        AccountMeta::new_readonly(accounts[2].key(), false),   // nft_account
        AccountMeta::new(accounts[3].key(), false),            // pool_state
        AccountMeta::new(accounts[4].key(), false),            // protocol_position
        AccountMeta::new(accounts[5].key(), false),            // personal_position
        AccountMeta::new(accounts[6].key(), false),            // tick_array_lower
        AccountMeta::new(accounts[7].key(), false),            // tick_array_upper
        AccountMeta::new(accounts[8].key(), false),            // token_account_0
        AccountMeta::new(accounts[9].key(), false),            // token_account_1
        AccountMeta::new(accounts[10].key(), false),           // token_vault_0
        AccountMeta::new(accounts[11].key(), false),           // token_vault_1
        AccountMeta::new_readonly(accounts[12].key(), false),  // token_program
        AccountMeta::new_readonly(accounts[13].key(), false),  // token_program_2022
        AccountMeta::new_readonly(accounts[14].key(), false),  // vault_0_mint
        AccountMeta::new_readonly(accounts[15].key(), false),  // vault_1_mint
    ];
    metas.extend(remaining_accounts.iter().map(trailing_meta));
    let mut all: Vec<AccountInfo<'info>> = accounts.to_vec();
    all.extend_from_slice(remaining_accounts);
    invoke_signed(&Instruction { program_id: RAYDIUM_CLMM_PROGRAM_ID, accounts: metas, data }, &all, signer_seeds)?;
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::integer_arithmetic)]
mod tests {
    use super::*;
    use anchor_lang::error::Error;

    fn pool_bytes(mint_0: &Pubkey, mint_1: &Pubkey, spacing: u16, tick: i32) -> Vec<u8> {
        let mut data = vec![0u8; 300];
        data[..8].copy_from_slice(&disc::POOL_STATE);
        data[pool_layout::TOKEN_MINT_0].copy_from_slice(mint_0.as_ref());
        data[pool_layout::TOKEN_MINT_1].copy_from_slice(mint_1.as_ref());
        data[pool_layout::TICK_SPACING].copy_from_slice(&spacing.to_le_bytes());
        data[pool_layout::TICK_CURRENT].copy_from_slice(&tick.to_le_bytes());
        data
    }

    #[test]
    fn test_parse_pool() {
        let (m0, m1) = (Pubkey::new_unique(), Pubkey::new_unique());
        let key = Pubkey::new_unique();
        let pool = PoolSnapshot::parse(key, &pool_bytes(&m0, &m1, 10, -1234)).unwrap();
        assert_eq!(pool.key, key);
        assert_eq!(pool.mint(TokenSide::Token0), m0);
        assert_eq!(pool.mint(TokenSide::Token1), m1);
        assert_eq!(pool.tick_spacing, 10);
        assert_eq!(pool.tick_current, -1234);
    }

    #[test]
    fn test_pool_wrong_tag_rejected() {
        let mut data = pool_bytes(&Pubkey::new_unique(), &Pubkey::new_unique(), 10, 0);
        data[..8].copy_from_slice(&disc::PERSONAL_POSITION_STATE);
        let err = PoolSnapshot::parse(Pubkey::new_unique(), &data).unwrap_err();
        assert_eq!(err, Error::from(ErrorCode::AccountDiscriminatorMismatch));

        let err = PoolSnapshot::parse(Pubkey::new_unique(), &[0u8; 4]).unwrap_err();
        assert_eq!(err, Error::from(ErrorCode::AccountDiscriminatorNotFound));
    }

    #[test]
    fn test_pool_truncated_rejected() {
        let data = pool_bytes(&Pubkey::new_unique(), &Pubkey::new_unique(), 10, 0);
        let err = PoolSnapshot::parse(Pubkey::new_unique(), &data[..200]).unwrap_err();
        assert_eq!(err, Error::from(StrategyError::InvalidPool));
    }

    #[test]
    fn test_parse_personal_position() {
        let (nft, pool) = (Pubkey::new_unique(), Pubkey::new_unique());
        let mut data = vec![0u8; 120];
        data[..8].copy_from_slice(&disc::PERSONAL_POSITION_STATE);
        data[position_layout::NFT_MINT].copy_from_slice(nft.as_ref());
        data[position_layout::POOL_ID].copy_from_slice(pool.as_ref());
        data[position_layout::TICK_LOWER].copy_from_slice(&(-600i32).to_le_bytes());
        data[position_layout::TICK_UPPER].copy_from_slice(&1200i32.to_le_bytes());
        data[position_layout::LIQUIDITY].copy_from_slice(&987_654u128.to_le_bytes());

        let position = PersonalPositionSnapshot::parse(&data).unwrap();
        assert_eq!(position.nft_mint, nft);
        assert_eq!(position.pool_id, pool);
        assert_eq!(position.tick_lower_index, -600);
        assert_eq!(position.tick_upper_index, 1200);
        assert_eq!(position.liquidity, 987_654);
    }

    #[test]
    fn test_tick_array_start_index() {
        // spacing 10 => 600 ticks per array
        assert_eq!(tick_array_start_index(0, 10), Some(0));
        assert_eq!(tick_array_start_index(599, 10), Some(0));
        assert_eq!(tick_array_start_index(600, 10), Some(600));
        assert_eq!(tick_array_start_index(-1, 10), Some(-600));
        assert_eq!(tick_array_start_index(-600, 10), Some(-600));
        assert_eq!(tick_array_start_index(-601, 10), Some(-1200));
        assert_eq!(tick_array_start_index(5, 0), None);
    }
}
