// meteora_vault_cpi.rs
//
// Meteora dynamic vault CPI module for clmm-strategy
// Program: 24Uqj9JCLxUeoC3hGfh5W3s9FM9uCHDS2SG3LYwBpyTi
//
// Single-asset holding vault. Deposits mint LP shares, withdrawals burn them.
// Discriminators verified as SHA256("global:<ix>")[0..8].

use anchor_lang::prelude::*;
use anchor_lang::solana_program;
use anchor_lang::solana_program::{
    instruction::{AccountMeta, Instruction},
    program::invoke_signed,
};

// ═══════════════════════════════════════════════════════════════════════════
// PROGRAM ID & CONSTANTS
// ═══════════════════════════════════════════════════════════════════════════

pub const METEORA_VAULT_PROGRAM_ID: Pubkey =
    solana_program::pubkey!("24Uqj9JCLxUeoC3hGfh5W3s9FM9uCHDS2SG3LYwBpyTi");

/// Base key Meteora uses for its permissionless vaults.
pub const VAULT_BASE_KEY: Pubkey =
    solana_program::pubkey!("HWzXGcGHy4tcpYfaRDCyLNzXqBTv3E6BttpCH2vJxArv");

pub const VAULT_SEED: &[u8] = b"vault";
pub const TOKEN_VAULT_SEED: &[u8] = b"token_vault";
pub const LP_MINT_SEED: &[u8] = b"lp_mint";

/// Program account plus the 7 instruction accounts.
pub const VAULT_ACCOUNTS: usize = 8;

// ═══════════════════════════════════════════════════════════════════════════
// DISCRIMINATORS
// ═══════════════════════════════════════════════════════════════════════════

pub mod disc {
    pub const DEPOSIT: [u8; 8]  = [0xf2, 0x23, 0xc6, 0x89, 0x52, 0xe1, 0xf2, 0xb6];
    pub const WITHDRAW: [u8; 8] = [0xb7, 0x12, 0x46, 0x9c, 0x94, 0x6d, 0xa1, 0x22];
}

// ═══════════════════════════════════════════════════════════════════════════
// PDA HELPERS
// ═══════════════════════════════════════════════════════════════════════════

pub fn vault_pda(token_mint: &Pubkey) -> (Pubkey, u8) {
    Pubkey::find_program_address(
        &[VAULT_SEED, token_mint.as_ref(), VAULT_BASE_KEY.as_ref()],
        &METEORA_VAULT_PROGRAM_ID,
    )
}

pub fn token_vault_pda(vault: &Pubkey) -> (Pubkey, u8) {
    Pubkey::find_program_address(&[TOKEN_VAULT_SEED, vault.as_ref()], &METEORA_VAULT_PROGRAM_ID)
}

pub fn lp_mint_pda(vault: &Pubkey) -> (Pubkey, u8) {
    Pubkey::find_program_address(&[LP_MINT_SEED, vault.as_ref()], &METEORA_VAULT_PROGRAM_ID)
}

// ═══════════════════════════════════════════════════════════════════════════
// CPI INSTRUCTIONS
// ═══════════════════════════════════════════════════════════════════════════

fn vault_metas(accounts: &[AccountInfo; VAULT_ACCOUNTS]) -> Vec<AccountMeta> {
    vec![
        AccountMeta::new(accounts[1].key(), false),           // vault
        AccountMeta::new(accounts[2].key(), false),           // token_vault
        AccountMeta::new(accounts[3].key(), false),           // lp_mint
        AccountMeta::new(accounts[4].key(), false),           // user_token
        AccountMeta::new(accounts[5].key(), false),           // user_lp
        AccountMeta::new_readonly(accounts[6].key(), true),   // user
        AccountMeta::new_readonly(accounts[7].key(), false),  // token_program
    ]
}

/// Accounts: program, vault(m), token_vault(m), lp_mint(m), user_token(m), user_lp(m),
///   user(s), token_program
pub fn deposit<'info>(
    accounts: &[AccountInfo<'info>; VAULT_ACCOUNTS],
    token_amount: u64,
    minimum_lp_token_amount: u64,
    signer_seeds: &[&[&[u8]]],
) -> Result<()> {
    let mut data = Vec::with_capacity(24);
    data.extend_from_slice(&disc::DEPOSIT);
    data.extend_from_slice(&token_amount.to_le_bytes());
    data.extend_from_slice(&minimum_lp_token_amount.to_le_bytes());

    let ix = Instruction { program_id: METEORA_VAULT_PROGRAM_ID, accounts: vault_metas(accounts), data };
    invoke_signed(&ix, accounts, signer_seeds)?;
    Ok(())
}

/// Same account list as `deposit`.
pub fn withdraw<'info>(
    accounts: &[AccountInfo<'info>; VAULT_ACCOUNTS],
    unmint_amount: u64,
    min_out_amount: u64,
    signer_seeds: &[&[&[u8]]],
) -> Result<()> {
    let mut data = Vec::with_capacity(24);
    data.extend_from_slice(&disc::WITHDRAW);
    data.extend_from_slice(&unmint_amount.to_le_bytes());
    data.extend_from_slice(&min_out_amount.to_le_bytes());

    let ix = Instruction { program_id: METEORA_VAULT_PROGRAM_ID, accounts: vault_metas(accounts), data };
    invoke_signed(&ix, accounts, signer_seeds)?;
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::integer_arithmetic)]
mod tests {
    use super::*;

    #[test]
    fn test_vault_pdas_chain_from_mint() {
        let mint = Pubkey::new_unique();
        let (vault, _) = vault_pda(&mint);
        let (expected, _) = Pubkey::find_program_address(
            &[VAULT_SEED, mint.as_ref(), VAULT_BASE_KEY.as_ref()],
            &METEORA_VAULT_PROGRAM_ID,
        );
        assert_eq!(vault, expected);
        assert_ne!(token_vault_pda(&vault).0, lp_mint_pda(&vault).0);
        assert_ne!(vault_pda(&Pubkey::new_unique()).0, vault);
    }
}
