// clmm-strategy Core Contract
// Custodies Raydium CLMM position NFTs and lets registered keepers park
// out-of-range liquidity in a Meteora dynamic vault, then redeploy it.
//
#![deny(clippy::integer_arithmetic)]
#![deny(clippy::unwrap_used)]
//
// Trust model:
// - Keepers choose WHEN to act, never WHERE funds go. Every CLMM and vault account
//   arrives in remaining_accounts and is re-derived in account_integrity before any CPI.
// - Treasury token accounts are ATAs of global_state; user_state only ever signs for its NFT.
// - Keepers are paid in credits, redeemed against the SOL treasury above its rent floor.

use anchor_lang::prelude::*;
use anchor_lang::solana_program;
use anchor_lang::system_program;
use anchor_spl::associated_token::AssociatedToken;
use anchor_spl::token::{transfer, Mint, Token, TokenAccount, Transfer};
use anchor_spl::token_2022::spl_token_2022::instruction::AuthorityType;
use anchor_spl::token_interface::{
    self, CloseAccount, Mint as IMint, SetAuthority, TokenAccount as ITokenAccount,
    TokenInterface, TransferChecked,
};

mod account_integrity;
mod meteora_vault_cpi;
mod raydium_clmm_cpi;
mod state;

use account_integrity::*;
use meteora_vault_cpi::VAULT_ACCOUNTS;
use raydium_clmm_cpi::{
    PersonalPositionSnapshot, PoolSnapshot, DECREASE_LIQUIDITY_V2_ACCOUNTS,
    INCREASE_LIQUIDITY_V2_ACCOUNTS, REWARD_GROUP_LEN, TOKEN_2022_PROGRAM_ID,
};
pub use state::*;

declare_id!("9N4ntbPEuUjYCqgNTjQyRuu2stbtzPBuBDCavgW3zsZ9");

/// Only this key may create the global state. It hands control to `admin` at init.
pub const BOOTSTRAP_KEY: Pubkey =
    solana_program::pubkey!("9S63kgmFNPvWdMBkTV2QYMKFpxp8kEKzd2QXwZbZrzZb");

#[derive(AnchorSerialize, AnchorDeserialize, Clone, Copy, Debug)]
pub struct InitConfigParams {
    pub enabled_actions: ActionSet,
    pub credits_for_decrease: u64,
    pub credits_for_increase: u64,
    pub sol_per_credit: u64,
    pub base_deposit: u64,
    pub fee_basis_points: u16,
}

#[program]
pub mod clmm_strategy {
    use super::*;

    // ============ ADMIN ============

    pub fn initialize_config(ctx: Context<InitializeConfig>, params: InitConfigParams) -> Result<()> {
        require!(params.fee_basis_points <= ALL_BASIS_POINTS, StrategyError::FeeTooHigh);

        let global_state = &mut ctx.accounts.global_state;
        global_state.admin = ctx.accounts.admin.key();
        global_state.enabled_actions = params.enabled_actions;
        global_state.credits_for_decrease = params.credits_for_decrease;
        global_state.credits_for_increase = params.credits_for_increase;
        global_state.sol_per_credit = params.sol_per_credit;
        global_state.base_deposit = params.base_deposit;
        global_state.fee_basis_points = params.fee_basis_points;
        global_state.sol_treasury = ctx.accounts.sol_treasury.key();
        global_state.config_version = 0;
        global_state.bump = ctx.bumps.global_state;
        global_state.treasury_bump = ctx.bumps.sol_treasury;

        ctx.accounts.sol_treasury.bump = ctx.bumps.sol_treasury;

        emit!(ConfigInitializedEvent {
            admin: global_state.admin,
            sol_treasury: global_state.sol_treasury,
            fee_basis_points: global_state.fee_basis_points,
            timestamp: Clock::get()?.unix_timestamp,
        });
        msg!("Config initialized | admin {} | fee {} bps", global_state.admin, global_state.fee_basis_points);
        Ok(())
    }

    pub fn change_config(ctx: Context<AdminOnly>, change: ConfigChange) -> Result<()> {
        let authority = ctx.accounts.admin.key();
        let global_state = &mut ctx.accounts.global_state;
        global_state.require_admin(&authority)?;
        global_state.apply_change(&change)?;

        emit!(AdminConfigEvent {
            field: change.field().into(),
            authority,
            config_version: global_state.config_version,
            timestamp: Clock::get()?.unix_timestamp,
        });
        msg!("Config changed: {} (version {})", change.field(), global_state.config_version);
        Ok(())
    }

    pub fn whitelist_mint(ctx: Context<WhitelistMint>) -> Result<()> {
        ctx.accounts.global_state.require_admin(&ctx.accounts.admin.key())?;

        let entry = &mut ctx.accounts.whitelist_entry;
        entry.mint = ctx.accounts.mint.key();
        entry.bump = ctx.bumps.whitelist_entry;

        emit!(MintWhitelistEvent {
            mint: entry.mint,
            whitelisted: true,
            timestamp: Clock::get()?.unix_timestamp,
        });
        msg!("Mint whitelisted: {}", entry.mint);
        Ok(())
    }

    /// Entry rent goes back to the admin via `close`.
    pub fn unwhitelist_mint(ctx: Context<UnwhitelistMint>) -> Result<()> {
        ctx.accounts.global_state.require_admin(&ctx.accounts.admin.key())?;

        emit!(MintWhitelistEvent {
            mint: ctx.accounts.whitelist_entry.mint,
            whitelisted: false,
            timestamp: Clock::get()?.unix_timestamp,
        });
        msg!("Mint removed from whitelist: {}", ctx.accounts.whitelist_entry.mint);
        Ok(())
    }

    pub fn withdraw_sol(ctx: Context<WithdrawSol>, amount: u64) -> Result<()> {
        ctx.accounts.global_state.require_admin(&ctx.accounts.admin.key())?;

        let treasury = ctx.accounts.sol_treasury.to_account_info();
        let rent_floor = Rent::get()?.minimum_balance(SolTreasury::SIZE);
        SolTreasury::check_withdrawal(treasury.lamports(), rent_floor, amount)?;
        move_lamports(&treasury, &ctx.accounts.recipient.to_account_info(), amount)?;

        emit!(TreasuryWithdrawEvent {
            authority: ctx.accounts.admin.key(),
            mint: None,
            amount,
            destination: ctx.accounts.recipient.key(),
            timestamp: Clock::get()?.unix_timestamp,
        });
        msg!("Treasury withdrew {} lamports to {}", amount, ctx.accounts.recipient.key());
        Ok(())
    }

    /// Sweeps accumulated vault fees (or any other balance) out of a treasury token account.
    pub fn withdraw_tokens(ctx: Context<WithdrawTokens>, amount: u64) -> Result<()> {
        ctx.accounts.global_state.require_admin(&ctx.accounts.admin.key())?;

        let signer_seeds: &[&[u8]] = &[GLOBAL_STATE_SEED, &[ctx.accounts.global_state.bump]];
        let signer = &[signer_seeds];
        transfer(
            CpiContext::new_with_signer(
                ctx.accounts.token_program.to_account_info(),
                Transfer {
                    from: ctx.accounts.source.to_account_info(),
                    to: ctx.accounts.destination.to_account_info(),
                    authority: ctx.accounts.global_state.to_account_info(),
                },
                signer,
            ),
            amount,
        )?;

        emit!(TreasuryWithdrawEvent {
            authority: ctx.accounts.admin.key(),
            mint: Some(ctx.accounts.source.mint),
            amount,
            destination: ctx.accounts.destination.key(),
            timestamp: Clock::get()?.unix_timestamp,
        });
        msg!("Treasury withdrew {} of mint {}", amount, ctx.accounts.source.mint);
        Ok(())
    }

    // ============ KEEPERS ============

    /// Permissionless. Anyone may fund the account for any keeper identity.
    pub fn create_keeper_account(ctx: Context<CreateKeeperAccount>) -> Result<()> {
        let keeper_account = &mut ctx.accounts.keeper_account;
        keeper_account.keeper = ctx.accounts.keeper.key();
        keeper_account.credits = 0;
        keeper_account.bump = ctx.bumps.keeper_account;

        emit!(KeeperCreatedEvent {
            keeper: keeper_account.keeper,
            payer: ctx.accounts.payer.key(),
            timestamp: Clock::get()?.unix_timestamp,
        });
        msg!("Keeper account created: {}", keeper_account.keeper);
        Ok(())
    }

    pub fn keeper_withdraw_rewards(ctx: Context<KeeperWithdrawRewards>) -> Result<()> {
        let keeper_account = &mut ctx.accounts.keeper_account;
        keeper_account.require_keeper(&ctx.accounts.keeper.key())?;

        let credits = keeper_account.take_credits()?;
        let payout = ctx.accounts.global_state.redemption_payout(credits)?;

        let treasury = ctx.accounts.sol_treasury.to_account_info();
        let rent_floor = Rent::get()?.minimum_balance(SolTreasury::SIZE);
        SolTreasury::check_withdrawal(treasury.lamports(), rent_floor, payout)?;
        move_lamports(&treasury, &ctx.accounts.keeper.to_account_info(), payout)?;

        emit!(RewardsWithdrawnEvent {
            keeper: ctx.accounts.keeper.key(),
            credits,
            lamports: payout,
            timestamp: Clock::get()?.unix_timestamp,
        });
        msg!("Keeper {} redeemed {} credits for {} lamports", ctx.accounts.keeper.key(), credits, payout);
        Ok(())
    }

    // ============ POSITIONS ============

    /// Takes custody of a CLMM position NFT and records its trigger thresholds.
    pub fn register_position(ctx: Context<RegisterPosition>, thresholds: TickThresholds) -> Result<()> {
        let global_state = &ctx.accounts.global_state;
        global_state.require_action(Action::CreatePosition)?;

        let nft_mint = ctx.accounts.nft_mint.key();
        let position_info = ctx.accounts.personal_position.to_account_info();
        let position = PersonalPositionSnapshot::load(&position_info)?;
        validate_registration(&RegistrationAccounts {
            personal_position: position_info.key(),
            position,
            nft_mint,
            nft_decimals: ctx.accounts.nft_mint.decimals,
            nft_supply: ctx.accounts.nft_mint.supply,
            pool: ctx.accounts.pool_state.key(),
        })?;
        let pool = PoolSnapshot::load(&ctx.accounts.pool_state.to_account_info())?;

        require_whitelisted(&pool.token_mint_0, &ctx.accounts.whitelist_0.to_account_info())?;
        require_whitelisted(&pool.token_mint_1, &ctx.accounts.whitelist_1.to_account_info())?;

        thresholds.validate(position.tick_lower_index, position.tick_upper_index)?;

        let user_state = &mut ctx.accounts.user_state;
        user_state.user = ctx.accounts.user.key();
        user_state.nft_mint = nft_mint;
        user_state.nft_token_program = ctx.accounts.nft_token_program.key();
        user_state.pool = pool.key;
        user_state.personal_position = position_info.key();
        user_state.tick_lower_index = position.tick_lower_index;
        user_state.tick_upper_index = position.tick_upper_index;
        user_state.tick_lower_out_threshold = thresholds.lower_out;
        user_state.tick_upper_out_threshold = thresholds.upper_out;
        user_state.tick_lower_in_threshold = thresholds.lower_in;
        user_state.tick_upper_in_threshold = thresholds.upper_in;
        user_state.mark_deployed();
        user_state.bump = ctx.bumps.user_state;

        token_interface::transfer_checked(
            CpiContext::new(
                ctx.accounts.nft_token_program.to_account_info(),
                TransferChecked {
                    from: ctx.accounts.user_nft_account.to_account_info(),
                    mint: ctx.accounts.nft_mint.to_account_info(),
                    to: ctx.accounts.position_nft_account.to_account_info(),
                    authority: ctx.accounts.user.to_account_info(),
                },
            ),
            1,
            0,
        )?;

        let base_deposit = global_state.base_deposit;
        if base_deposit > 0 {
            system_program::transfer(
                CpiContext::new(
                    ctx.accounts.system_program.to_account_info(),
                    system_program::Transfer {
                        from: ctx.accounts.user.to_account_info(),
                        to: ctx.accounts.user_state.to_account_info(),
                    },
                ),
                base_deposit,
            )?;
        }

        emit!(PositionRegisteredEvent {
            user: ctx.accounts.user.key(),
            user_state: ctx.accounts.user_state.key(),
            nft_mint,
            pool: pool.key,
            tick_lower_index: position.tick_lower_index,
            tick_upper_index: position.tick_upper_index,
            base_deposit,
            timestamp: Clock::get()?.unix_timestamp,
        });
        msg!(
            "Position registered: {} | ticks [{},{}] | out [{},{}] in [{},{}]",
            nft_mint,
            position.tick_lower_index,
            position.tick_upper_index,
            thresholds.lower_out,
            thresholds.upper_out,
            thresholds.lower_in,
            thresholds.upper_in
        );
        Ok(())
    }

    /// Pulls all liquidity once the pool tick leaves the out-thresholds and parks the
    /// single remaining asset in the holding vault.
    ///
    /// remaining_accounts: [vault deposit (8)] [decrease_liquidity_v2 (17)]
    ///   [bitmap extension?] [(reward_vault, recipient, reward_mint) x0..3]
    pub fn keeper_decrease<'a>(
        ctx: Context<'_, '_, 'a, 'a, KeeperAction<'a>>,
        lp_amount_min: u64,
    ) -> Result<()> {
        let remaining: &'a [AccountInfo<'a>] = ctx.remaining_accounts;
        let accounts = &ctx.accounts;
        accounts.keeper_account.require_keeper(&accounts.keeper.key())?;
        accounts.global_state.require_action(Action::DecreasePosition)?;

        let record = &accounts.user_state;
        require!(record.state == PositionState::Deployed, StrategyError::PositionDeployed);

        let pool_index = VAULT_ACCOUNTS.checked_add(decrease_slot::POOL).ok_or(StrategyError::Overflow)?;
        let pool = load_pool(remaining, pool_index, record)?;
        let side = record.decrease_side(pool.tick_current)?;

        // ---- account integrity ----
        let keys: Vec<Pubkey> = remaining.iter().map(|a| a.key()).collect();
        let derivation =
            derivation_context(accounts.global_state.key(), accounts.user_state.key(), record, pool, side);
        let fixed = validate_roles(&[&VAULT_ROLES, &DECREASE_ROLES], &keys, &derivation)?;
        let trailing_keys = keys.get(fixed..).unwrap_or_default();
        let trailing = validate_trailing(trailing_keys, &pool.key, TrailingPolicy::BitmapAndRewards)?;

        let trailing_infos = remaining.get(fixed..).unwrap_or_default();
        let reward_infos = trailing_infos.get(trailing.reward_offset()..).unwrap_or_default();
        for group in reward_infos.chunks_exact(REWARD_GROUP_LEN) {
            let recipient_info = group.get(1).ok_or(StrategyError::MissingAccounts)?;
            let recipient = InterfaceAccount::<ITokenAccount>::try_from(recipient_info)?;
            require_keys_eq!(recipient.owner, record.user, StrategyError::InvalidTokenAccount);
        }

        let vault_accounts = account_window::<VAULT_ACCOUNTS>(remaining, 0)?;
        let clmm_accounts = account_window::<DECREASE_LIQUIDITY_V2_ACCOUNTS>(remaining, VAULT_ACCOUNTS)?;

        let position_index = VAULT_ACCOUNTS.checked_add(3).ok_or(StrategyError::Overflow)?;
        let position_info = remaining.get(position_index).ok_or(StrategyError::MissingAccounts)?;
        let liquidity = PersonalPositionSnapshot::load(position_info)?.liquidity;
        require!(liquidity > 0, StrategyError::InsufficientLiquidity);

        // ---- remove liquidity into the treasury ATAs ----
        let user_seeds: &[&[u8]] = &[USER_STATE_SEED, record.nft_mint.as_ref(), &[record.bump]];
        let deposit_token = &vault_accounts[vault_slot::TREASURY_DEPOSIT_TOKEN];
        let before = token_amount(deposit_token)?;
        raydium_clmm_cpi::decrease_liquidity_v2(clmm_accounts, liquidity, 0, 0, &[user_seeds], trailing_infos)?;
        let removed = token_amount(deposit_token)?.checked_sub(before).ok_or(StrategyError::Overflow)?;
        require!(removed > 0, StrategyError::InsufficientLiquidity);

        // ---- park the vaulted side ----
        let global_seeds: &[&[u8]] = &[GLOBAL_STATE_SEED, &[accounts.global_state.bump]];
        let lp_token = &vault_accounts[vault_slot::TREASURY_LP_TOKEN];
        let lp_before = token_amount(lp_token)?;
        meteora_vault_cpi::deposit(vault_accounts, removed, lp_amount_min, &[global_seeds])?;
        let lp_amount = token_amount(lp_token)?.checked_sub(lp_before).ok_or(StrategyError::Overflow)?;
        check_slippage(lp_amount, lp_amount_min)?;

        let credits = accounts.global_state.credits_for_decrease;
        let user_state_key = accounts.user_state.key();
        let keeper_key = accounts.keeper.key();
        ctx.accounts.user_state.mark_vaulted(side, liquidity, removed, lp_amount)?;
        ctx.accounts.keeper_account.credit(credits)?;

        emit!(PositionDecreasedEvent {
            user_state: user_state_key,
            keeper: keeper_key,
            side,
            tick_current: pool.tick_current,
            liquidity,
            amount_deposited: removed,
            lp_amount,
            timestamp: Clock::get()?.unix_timestamp,
        });
        msg!(
            "Position decreased: {:?} | tick {} | {} into vault for {} lp | keeper +{}",
            side,
            pool.tick_current,
            removed,
            lp_amount,
            credits
        );
        Ok(())
    }

    /// Withdraws the vaulted side once the pool tick is back inside the in-thresholds and
    /// redeploys it into the same position: single-sided while the tick is still on the
    /// vaulted side of the range, or the recorded liquidity once the tick is inside it.
    ///
    /// remaining_accounts: [vault withdraw (8)] [increase_liquidity_v2 (16)] [bitmap extension?]
    pub fn keeper_increase<'a>(
        ctx: Context<'_, '_, 'a, 'a, KeeperAction<'a>>,
        token_amount_min: u64,
    ) -> Result<()> {
        let remaining: &'a [AccountInfo<'a>] = ctx.remaining_accounts;
        let accounts = &ctx.accounts;
        accounts.keeper_account.require_keeper(&accounts.keeper.key())?;
        accounts.global_state.require_action(Action::IncreasePosition)?;

        let record = &accounts.user_state;
        let vaulted = vaulted_accounts(remaining, &accounts.global_state.key(), record)?;
        let plan = record.redeploy_plan(vaulted.pool.tick_current)?;
        let side = plan.side();

        let exit = withdraw_from_vault(vaulted.vault, record, &accounts.global_state, token_amount_min)?;
        let liquidity = redeploy_into_position(&vaulted, record, &accounts.global_state, plan, exit.redeploy)?;

        let credits = accounts.global_state.increase_credits(&plan);
        let user_state_key = accounts.user_state.key();
        let keeper_key = accounts.keeper.key();
        ctx.accounts.user_state.mark_deployed();
        ctx.accounts.keeper_account.credit(credits)?;

        emit!(PositionIncreasedEvent {
            user_state: user_state_key,
            keeper: keeper_key,
            side,
            tick_current: vaulted.pool.tick_current,
            liquidity,
            withdrawn: exit.withdrawn,
            redeployed: exit.redeploy,
            fee: exit.fee,
            timestamp: Clock::get()?.unix_timestamp,
        });
        msg!(
            "Position increased: {:?} | tick {} | liquidity {} | withdrew {} redeployed {} fee {} | keeper +{}",
            side,
            vaulted.pool.tick_current,
            liquidity,
            exit.withdrawn,
            exit.redeploy,
            exit.fee,
            credits
        );
        Ok(())
    }

    /// Returns the NFT and every lamport held by the record (base deposit included).
    /// A vaulted position is unwound first: the vault shares are withdrawn and the funds go
    /// back into the position single-sided when the market accepts them, otherwise to the
    /// user's token account.
    ///
    /// remaining_accounts (vaulted only): [vault withdraw (8)] [increase_liquidity_v2 (16)]
    ///   [bitmap extension?]
    pub fn close_position<'a>(
        ctx: Context<'_, '_, 'a, 'a, ClosePosition<'a>>,
        token_amount_min: u64,
    ) -> Result<()> {
        let remaining: &'a [AccountInfo<'a>] = ctx.remaining_accounts;
        let accounts = &ctx.accounts;
        let record = &accounts.user_state;
        record.require_owner(&accounts.user.key())?;

        let mut exit = VaultExit::default();
        let mut paid_out = 0u64;
        if let PositionState::Vaulted(_) = record.state {
            let vaulted = vaulted_accounts(remaining, &accounts.global_state.key(), record)?;
            let plan = record.close_plan(vaulted.pool.tick_current)?;
            exit = withdraw_from_vault(vaulted.vault, record, &accounts.global_state, token_amount_min)?;

            match plan {
                Redeploy::Payout(side) => {
                    let payout_account = accounts
                        .user_payout_account
                        .as_ref()
                        .ok_or(StrategyError::MissingAccounts)?;
                    require_keys_eq!(payout_account.owner, record.user, StrategyError::InvalidTokenAccount);
                    require_keys_eq!(payout_account.mint, vaulted.pool.mint(side), StrategyError::InvalidTokenAccount);

                    let global_seeds: &[&[u8]] = &[GLOBAL_STATE_SEED, &[accounts.global_state.bump]];
                    transfer(
                        CpiContext::new_with_signer(
                            vaulted.vault[vault_slot::TOKEN_PROGRAM].clone(),
                            Transfer {
                                from: vaulted.vault[vault_slot::TREASURY_DEPOSIT_TOKEN].clone(),
                                to: payout_account.to_account_info(),
                                authority: accounts.global_state.to_account_info(),
                            },
                            &[global_seeds],
                        ),
                        exit.redeploy,
                    )?;
                    paid_out = exit.redeploy;
                }
                _ => {
                    redeploy_into_position(&vaulted, record, &accounts.global_state, plan, exit.redeploy)?;
                }
            }
        }

        let nft_mint = record.nft_mint;
        let bump = record.bump;
        let signer_seeds: &[&[u8]] = &[USER_STATE_SEED, nft_mint.as_ref(), &[bump]];
        let signer = &[signer_seeds];

        token_interface::transfer_checked(
            CpiContext::new_with_signer(
                accounts.nft_token_program.to_account_info(),
                TransferChecked {
                    from: accounts.position_nft_account.to_account_info(),
                    mint: accounts.nft_mint.to_account_info(),
                    to: accounts.user_nft_account.to_account_info(),
                    authority: accounts.user_state.to_account_info(),
                },
                signer,
            ),
            1,
            0,
        )?;

        token_interface::close_account(CpiContext::new_with_signer(
            accounts.nft_token_program.to_account_info(),
            CloseAccount {
                account: accounts.position_nft_account.to_account_info(),
                destination: accounts.user.to_account_info(),
                authority: accounts.user_state.to_account_info(),
            },
            signer,
        ))?;

        // Record lamports move to the user via the `close` constraint on exit
        let refunded_lamports = accounts.user_state.to_account_info().lamports();

        emit!(PositionClosedEvent {
            user: accounts.user.key(),
            nft_mint,
            withdrawn: exit.withdrawn,
            redeployed: exit.redeploy.checked_sub(paid_out).ok_or(StrategyError::Overflow)?,
            paid_out,
            fee: exit.fee,
            refunded_lamports,
            timestamp: Clock::get()?.unix_timestamp,
        });
        msg!(
            "Position closed: {} | vault withdrew {} paid out {} fee {} | refunded {} lamports",
            nft_mint,
            exit.withdrawn,
            paid_out,
            exit.fee,
            refunded_lamports
        );
        Ok(())
    }
}

// ============ HELPERS ============

/// The entry must be this program's live whitelist PDA for `mint`.
fn require_whitelisted(mint: &Pubkey, entry: &AccountInfo) -> Result<()> {
    let (expected, _) = Pubkey::find_program_address(&[WHITELIST_SEED, mint.as_ref()], &crate::ID);
    require_keys_eq!(entry.key(), expected, StrategyError::NotWhitelisted);
    require!(entry.owner == &crate::ID && !entry.data_is_empty(), StrategyError::NotWhitelisted);

    let data = entry.try_borrow_data()?;
    let whitelisted = WhitelistEntry::try_deserialize(&mut &data[..])
        .map_err(|_| StrategyError::NotWhitelisted)?;
    require_keys_eq!(whitelisted.mint, *mint, StrategyError::NotWhitelisted);
    Ok(())
}

/// Lamport move out of a program-owned account. system_program::transfer needs a system-owned source.
fn move_lamports(from: &AccountInfo, to: &AccountInfo, amount: u64) -> Result<()> {
    let from_balance = from.lamports().checked_sub(amount).ok_or(StrategyError::InsufficientTreasury)?;
    let to_balance = to.lamports().checked_add(amount).ok_or(StrategyError::Overflow)?;
    **from.try_borrow_mut_lamports()? = from_balance;
    **to.try_borrow_mut_lamports()? = to_balance;
    Ok(())
}

/// Fresh balance read. Used before and after a CPI to measure deltas.
fn token_amount<'a>(info: &'a AccountInfo<'a>) -> Result<u64> {
    Ok(Account::<TokenAccount>::try_from(info)?.amount)
}

fn account_window<'a, 'info, const N: usize>(
    accounts: &'a [AccountInfo<'info>],
    start: usize,
) -> Result<&'a [AccountInfo<'info>; N]> {
    let end = start.checked_add(N).ok_or(StrategyError::Overflow)?;
    accounts
        .get(start..end)
        .and_then(|window| window.try_into().ok())
        .ok_or_else(|| error!(StrategyError::MissingAccounts))
}

fn load_pool(
    remaining: &[AccountInfo],
    index: usize,
    record: &UserPositionRecord,
) -> Result<PoolSnapshot> {
    let info = remaining.get(index).ok_or(StrategyError::MissingAccounts)?;
    require_keys_eq!(info.key(), record.pool, StrategyError::InvalidPool);
    PoolSnapshot::load(info)
}

fn derivation_context(
    global_state: Pubkey,
    user_state: Pubkey,
    record: &UserPositionRecord,
    pool: PoolSnapshot,
    side: TokenSide,
) -> DerivationContext {
    DerivationContext {
        global_state,
        user_state,
        nft_mint: record.nft_mint,
        nft_token_program: record.nft_token_program,
        personal_position: record.personal_position,
        tick_lower_index: record.tick_lower_index,
        tick_upper_index: record.tick_upper_index,
        pool,
        vault_side: side,
    }
}

/// Validated [vault withdraw] [increase_liquidity_v2] [bitmap?] windows of a vaulted record.
struct VaultedAccounts<'a> {
    pool: PoolSnapshot,
    vault: &'a [AccountInfo<'a>; VAULT_ACCOUNTS],
    clmm: &'a [AccountInfo<'a>; INCREASE_LIQUIDITY_V2_ACCOUNTS],
    trailing: &'a [AccountInfo<'a>],
}

fn vaulted_accounts<'a>(
    remaining: &'a [AccountInfo<'a>],
    global_state: &Pubkey,
    record: &Account<'a, UserPositionRecord>,
) -> Result<VaultedAccounts<'a>> {
    let side = record.vaulted_side()?;
    let pool_index = VAULT_ACCOUNTS.checked_add(increase_slot::POOL).ok_or(StrategyError::Overflow)?;
    let pool = load_pool(remaining, pool_index, record)?;

    let keys: Vec<Pubkey> = remaining.iter().map(|a| a.key()).collect();
    let derivation = derivation_context(*global_state, record.key(), record, pool, side);
    let fixed = validate_roles(&[&VAULT_ROLES, &INCREASE_ROLES], &keys, &derivation)?;
    let trailing_keys = keys.get(fixed..).unwrap_or_default();
    validate_trailing(trailing_keys, &pool.key, TrailingPolicy::BitmapOnly)?;

    Ok(VaultedAccounts {
        pool,
        vault: account_window::<VAULT_ACCOUNTS>(remaining, 0)?,
        clmm: account_window::<INCREASE_LIQUIDITY_V2_ACCOUNTS>(remaining, VAULT_ACCOUNTS)?,
        trailing: remaining.get(fixed..).unwrap_or_default(),
    })
}

#[derive(Clone, Copy, Debug, Default)]
struct VaultExit {
    withdrawn: u64,
    redeploy: u64,
    fee: u64,
}

/// Burns every vault share of the record into the treasury deposit ATA and splits
/// the proceeds into the user's part and the protocol fee.
fn withdraw_from_vault<'a>(
    vault_accounts: &'a [AccountInfo<'a>; VAULT_ACCOUNTS],
    record: &UserPositionRecord,
    global_state: &GlobalConfig,
    token_amount_min: u64,
) -> Result<VaultExit> {
    let global_seeds: &[&[u8]] = &[GLOBAL_STATE_SEED, &[global_state.bump]];
    let deposit_token = &vault_accounts[vault_slot::TREASURY_DEPOSIT_TOKEN];
    let before = token_amount(deposit_token)?;
    meteora_vault_cpi::withdraw(vault_accounts, record.lp_amount, token_amount_min, &[global_seeds])?;
    let withdrawn = token_amount(deposit_token)?.checked_sub(before).ok_or(StrategyError::Overflow)?;

    let (redeploy, fee) = global_state.split_withdrawal(record.amount_deposited_into_vault, withdrawn)?;
    check_slippage(redeploy, token_amount_min)?;
    Ok(VaultExit { withdrawn, redeploy, fee })
}

/// Deposits `amount` back into the position with global_state as temporary NFT owner.
/// Returns the liquidity requested from the market (zero for a single-sided deposit).
fn redeploy_into_position<'a>(
    vaulted: &VaultedAccounts<'a>,
    user_state: &Account<'a, UserPositionRecord>,
    global_state: &Account<'a, GlobalConfig>,
    plan: Redeploy,
    amount: u64,
) -> Result<u128> {
    let clmm_accounts = vaulted.clmm;
    let side = plan.side();
    let (liquidity, (amount_0_max, amount_1_max), base_flag) = match plan {
        Redeploy::SingleSided(_) => (0, side.split(amount), Some(side.base_flag())),
        Redeploy::Liquidity { liquidity, .. } => {
            // the counter token is whatever the treasury ATA holds for that mint
            let other_slot = match side.other() {
                TokenSide::Token0 => increase_slot::TREASURY_TOKEN_0,
                TokenSide::Token1 => increase_slot::TREASURY_TOKEN_1,
            };
            let other_balance = token_amount(&clmm_accounts[other_slot])?;
            (liquidity, side.pair(amount, other_balance), None)
        }
        Redeploy::Payout(_) => return err!(StrategyError::TickNotWithinRange),
    };

    let nft_account = &clmm_accounts[increase_slot::POSITION_NFT_ACCOUNT];
    let nft_token_program = if user_state.nft_token_program == TOKEN_2022_PROGRAM_ID {
        &clmm_accounts[increase_slot::TOKEN_PROGRAM_2022]
    } else {
        &clmm_accounts[increase_slot::TOKEN_PROGRAM]
    };
    let user_seeds: &[&[u8]] = &[USER_STATE_SEED, user_state.nft_mint.as_ref(), &[user_state.bump]];
    let global_seeds: &[&[u8]] = &[GLOBAL_STATE_SEED, &[global_state.bump]];

    token_interface::set_authority(
        CpiContext::new_with_signer(
            nft_token_program.clone(),
            SetAuthority {
                current_authority: user_state.to_account_info(),
                account_or_mint: nft_account.clone(),
            },
            &[user_seeds],
        ),
        AuthorityType::AccountOwner,
        Some(global_state.key()),
    )?;

    raydium_clmm_cpi::increase_liquidity_v2(
        clmm_accounts,
        liquidity,
        amount_0_max,
        amount_1_max,
        base_flag,
        &[global_seeds],
        vaulted.trailing,
    )?;

    token_interface::set_authority(
        CpiContext::new_with_signer(
            nft_token_program.clone(),
            SetAuthority {
                current_authority: global_state.to_account_info(),
                account_or_mint: nft_account.clone(),
            },
            &[global_seeds],
        ),
        AuthorityType::AccountOwner,
        Some(user_state.key()),
    )?;
    Ok(liquidity)
}

// ============ EVENTS ============

#[event]
pub struct ConfigInitializedEvent {
    pub admin: Pubkey,
    pub sol_treasury: Pubkey,
    pub fee_basis_points: u16,
    pub timestamp: i64,
}

#[event]
pub struct AdminConfigEvent {
    pub field: String,
    pub authority: Pubkey,
    pub config_version: u64,
    pub timestamp: i64,
}

#[event]
pub struct MintWhitelistEvent {
    pub mint: Pubkey,
    pub whitelisted: bool,
    pub timestamp: i64,
}

#[event]
pub struct KeeperCreatedEvent {
    pub keeper: Pubkey,
    pub payer: Pubkey,
    pub timestamp: i64,
}

#[event]
pub struct PositionRegisteredEvent {
    pub user: Pubkey,
    pub user_state: Pubkey,
    pub nft_mint: Pubkey,
    pub pool: Pubkey,
    pub tick_lower_index: i32,
    pub tick_upper_index: i32,
    pub base_deposit: u64,
    pub timestamp: i64,
}

#[event]
pub struct PositionDecreasedEvent {
    pub user_state: Pubkey,
    pub keeper: Pubkey,
    pub side: TokenSide,
    pub tick_current: i32,
    pub liquidity: u128,
    pub amount_deposited: u64,
    pub lp_amount: u64,
    pub timestamp: i64,
}

#[event]
pub struct PositionIncreasedEvent {
    pub user_state: Pubkey,
    pub keeper: Pubkey,
    pub side: TokenSide,
    pub tick_current: i32,
    pub liquidity: u128, // zero for a single-sided deposit
    pub withdrawn: u64,
    pub redeployed: u64,
    pub fee: u64,
    pub timestamp: i64,
}

#[event]
pub struct PositionClosedEvent {
    pub user: Pubkey,
    pub nft_mint: Pubkey,
    // vault unwind, all zero when the position was deployed
    pub withdrawn: u64,
    pub redeployed: u64,
    pub paid_out: u64,
    pub fee: u64,
    pub refunded_lamports: u64,
    pub timestamp: i64,
}

#[event]
pub struct RewardsWithdrawnEvent {
    pub keeper: Pubkey,
    pub credits: u64,
    pub lamports: u64,
    pub timestamp: i64,
}

#[event]
pub struct TreasuryWithdrawEvent {
    pub authority: Pubkey,
    pub mint: Option<Pubkey>,    // None for SOL
    pub amount: u64,
    pub destination: Pubkey,
    pub timestamp: i64,
}

// ============ CONTEXTS ============

#[derive(Accounts)]
pub struct InitializeConfig<'info> {
    #[account(address = BOOTSTRAP_KEY @ StrategyError::UnauthorizedAdmin)]
    pub initializer: Signer<'info>,

    #[account(mut)]
    pub admin: Signer<'info>,

    #[account(
        init,
        payer = admin,
        space = GlobalConfig::SIZE,
        seeds = [GLOBAL_STATE_SEED],
        bump
    )]
    pub global_state: Box<Account<'info, GlobalConfig>>,

    #[account(
        init,
        payer = admin,
        space = SolTreasury::SIZE,
        seeds = [SOL_TREASURY_SEED],
        bump
    )]
    pub sol_treasury: Account<'info, SolTreasury>,

    pub system_program: Program<'info, System>,
}

#[derive(Accounts)]
pub struct AdminOnly<'info> {
    pub admin: Signer<'info>,

    #[account(mut, seeds = [GLOBAL_STATE_SEED], bump = global_state.bump)]
    pub global_state: Account<'info, GlobalConfig>,
}

#[derive(Accounts)]
pub struct WhitelistMint<'info> {
    #[account(mut)]
    pub admin: Signer<'info>,

    #[account(seeds = [GLOBAL_STATE_SEED], bump = global_state.bump)]
    pub global_state: Account<'info, GlobalConfig>,

    pub mint: Account<'info, Mint>,

    #[account(
        init,
        payer = admin,
        space = WhitelistEntry::SIZE,
        seeds = [WHITELIST_SEED, mint.key().as_ref()],
        bump
    )]
    pub whitelist_entry: Account<'info, WhitelistEntry>,

    pub system_program: Program<'info, System>,
}

#[derive(Accounts)]
pub struct UnwhitelistMint<'info> {
    #[account(mut)]
    pub admin: Signer<'info>,

    #[account(seeds = [GLOBAL_STATE_SEED], bump = global_state.bump)]
    pub global_state: Account<'info, GlobalConfig>,

    #[account(
        mut,
        close = admin,
        seeds = [WHITELIST_SEED, whitelist_entry.mint.as_ref()],
        bump = whitelist_entry.bump
    )]
    pub whitelist_entry: Account<'info, WhitelistEntry>,
}

#[derive(Accounts)]
pub struct WithdrawSol<'info> {
    pub admin: Signer<'info>,

    #[account(seeds = [GLOBAL_STATE_SEED], bump = global_state.bump)]
    pub global_state: Account<'info, GlobalConfig>,

    #[account(mut, seeds = [SOL_TREASURY_SEED], bump = global_state.treasury_bump)]
    pub sol_treasury: Account<'info, SolTreasury>,

    /// CHECK: Any lamport destination chosen by the admin
    #[account(mut)]
    pub recipient: UncheckedAccount<'info>,
}

#[derive(Accounts)]
pub struct WithdrawTokens<'info> {
    pub admin: Signer<'info>,

    #[account(seeds = [GLOBAL_STATE_SEED], bump = global_state.bump)]
    pub global_state: Account<'info, GlobalConfig>,

    #[account(mut, constraint = source.owner == global_state.key() @ StrategyError::InvalidTokenAccount)]
    pub source: Account<'info, TokenAccount>,

    #[account(mut, constraint = destination.mint == source.mint @ StrategyError::InvalidTokenAccount)]
    pub destination: Account<'info, TokenAccount>,

    pub token_program: Program<'info, Token>,
}

#[derive(Accounts)]
pub struct CreateKeeperAccount<'info> {
    #[account(mut)]
    pub payer: Signer<'info>,

    /// CHECK: Identity only, never read
    pub keeper: UncheckedAccount<'info>,

    #[account(
        init,
        payer = payer,
        space = KeeperAccount::SIZE,
        seeds = [KEEPER_SEED, keeper.key().as_ref()],
        bump
    )]
    pub keeper_account: Account<'info, KeeperAccount>,

    pub system_program: Program<'info, System>,
}

#[derive(Accounts)]
pub struct KeeperWithdrawRewards<'info> {
    #[account(mut)]
    pub keeper: Signer<'info>,

    #[account(mut, seeds = [KEEPER_SEED, keeper_account.keeper.as_ref()], bump = keeper_account.bump)]
    pub keeper_account: Account<'info, KeeperAccount>,

    #[account(seeds = [GLOBAL_STATE_SEED], bump = global_state.bump)]
    pub global_state: Account<'info, GlobalConfig>,

    #[account(mut, seeds = [SOL_TREASURY_SEED], bump = global_state.treasury_bump)]
    pub sol_treasury: Account<'info, SolTreasury>,
}

#[derive(Accounts)]
pub struct RegisterPosition<'info> {
    #[account(mut)]
    pub user: Signer<'info>,

    #[account(seeds = [GLOBAL_STATE_SEED], bump = global_state.bump)]
    pub global_state: Box<Account<'info, GlobalConfig>>,

    #[account(
        init,
        payer = user,
        space = UserPositionRecord::SIZE,
        seeds = [USER_STATE_SEED, nft_mint.key().as_ref()],
        bump
    )]
    pub user_state: Box<Account<'info, UserPositionRecord>>,

    #[account(mint::token_program = nft_token_program)]
    pub nft_mint: Box<InterfaceAccount<'info, IMint>>,

    #[account(
        mut,
        token::mint = nft_mint,
        token::authority = user,
        token::token_program = nft_token_program
    )]
    pub user_nft_account: Box<InterfaceAccount<'info, ITokenAccount>>,

    #[account(
        init,
        payer = user,
        associated_token::mint = nft_mint,
        associated_token::authority = user_state,
        associated_token::token_program = nft_token_program
    )]
    pub position_nft_account: Box<InterfaceAccount<'info, ITokenAccount>>,

    /// CHECK: CLMM personal position. Owner, tag and PDA checked in handler
    pub personal_position: UncheckedAccount<'info>,

    /// CHECK: CLMM pool. Owner, tag and key checked in handler
    pub pool_state: UncheckedAccount<'info>,

    /// CHECK: Whitelist entry for pool token_mint_0, checked in handler
    pub whitelist_0: UncheckedAccount<'info>,

    /// CHECK: Whitelist entry for pool token_mint_1, checked in handler
    pub whitelist_1: UncheckedAccount<'info>,

    pub nft_token_program: Interface<'info, TokenInterface>,
    pub associated_token_program: Program<'info, AssociatedToken>,
    pub system_program: Program<'info, System>,
}

/// Shared by keeper_decrease and keeper_increase. All market and vault
/// accounts come through remaining_accounts.
#[derive(Accounts)]
pub struct KeeperAction<'info> {
    pub keeper: Signer<'info>,

    #[account(mut, seeds = [KEEPER_SEED, keeper_account.keeper.as_ref()], bump = keeper_account.bump)]
    pub keeper_account: Account<'info, KeeperAccount>,

    #[account(seeds = [GLOBAL_STATE_SEED], bump = global_state.bump)]
    pub global_state: Box<Account<'info, GlobalConfig>>,

    #[account(mut, seeds = [USER_STATE_SEED, user_state.nft_mint.as_ref()], bump = user_state.bump)]
    pub user_state: Box<Account<'info, UserPositionRecord>>,
}

#[derive(Accounts)]
pub struct ClosePosition<'info> {
    #[account(mut)]
    pub user: Signer<'info>,

    #[account(seeds = [GLOBAL_STATE_SEED], bump = global_state.bump)]
    pub global_state: Box<Account<'info, GlobalConfig>>,

    #[account(
        mut,
        close = user,
        seeds = [USER_STATE_SEED, user_state.nft_mint.as_ref()],
        bump = user_state.bump
    )]
    pub user_state: Box<Account<'info, UserPositionRecord>>,

    #[account(
        address = user_state.nft_mint @ StrategyError::InvalidNftMint,
        mint::token_program = nft_token_program
    )]
    pub nft_mint: Box<InterfaceAccount<'info, IMint>>,

    #[account(
        mut,
        associated_token::mint = nft_mint,
        associated_token::authority = user_state,
        associated_token::token_program = nft_token_program
    )]
    pub position_nft_account: Box<InterfaceAccount<'info, ITokenAccount>>,

    #[account(
        mut,
        token::mint = nft_mint,
        token::authority = user,
        token::token_program = nft_token_program
    )]
    pub user_nft_account: Box<InterfaceAccount<'info, ITokenAccount>>,

    #[account(address = user_state.nft_token_program @ StrategyError::InvalidProgram)]
    pub nft_token_program: Interface<'info, TokenInterface>,

    /// Receives the vaulted token when it cannot go back into the position.
    #[account(mut)]
    pub user_payout_account: Option<Box<Account<'info, TokenAccount>>>,
}

// ============ ERRORS ============

#[error_code]
pub enum StrategyError {
    #[msg("Action is disabled")]
    UnauthorizedAction,
    #[msg("Signer is not the position owner")]
    UnauthorizedUser,
    #[msg("Signer is not the admin")]
    UnauthorizedAdmin,
    #[msg("Signer is not the registered keeper")]
    UnauthorizedKeeper,
    #[msg("Position registration is closed")]
    NotOpen,
    #[msg("Pool mint is not whitelisted")]
    NotWhitelisted,
    #[msg("Invalid token, vault or tick array account")]
    InvalidTokenAccount,
    #[msg("Invalid CLMM pool")]
    InvalidPool,
    #[msg("Invalid position NFT, custody account or personal position")]
    InvalidNftMint,
    #[msg("Invalid program ID")]
    InvalidProgram,
    #[msg("Invalid global state account")]
    InvalidGlobalState,
    #[msg("Invalid user state account")]
    InvalidUserState,
    #[msg("Not enough accounts supplied")]
    MissingAccounts,
    #[msg("Unexpected trailing account")]
    UnexpectedAccount,
    #[msg("Position liquidity is not deployed in the pool")]
    PositionDeployed,
    #[msg("Position liquidity is already deployed")]
    PositionNotDeployed,
    #[msg("Pool tick is not beyond the out-thresholds")]
    TickNotOutOfRange,
    #[msg("Pool tick is not within the in-thresholds")]
    TickNotWithinRange,
    #[msg("Thresholds must satisfy out <= in < position range < in <= out")]
    InvalidTickThresholds,
    #[msg("Received amount below minimum")]
    SlippageExceeded,
    #[msg("Position has no liquidity to remove")]
    InsufficientLiquidity,
    #[msg("Keeper has no credits")]
    InsufficientCredits,
    #[msg("Treasury balance above rent is too low")]
    InsufficientTreasury,
    #[msg("Arithmetic overflow")]
    Overflow,
    #[msg("Fee too high (max 100%)")]
    FeeTooHigh,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::integer_arithmetic)]
mod tests {
    use super::*;
    use anchor_lang::error::Error;

    fn entry_data(mint: Pubkey) -> Vec<u8> {
        let mut data = Vec::new();
        WhitelistEntry { mint, bump: 255 }.try_serialize(&mut data).unwrap();
        data
    }

    fn check(mint: &Pubkey, key: Pubkey, owner: Pubkey, mut data: Vec<u8>) -> Result<()> {
        let mut lamports = 1_000_000u64;
        let info = AccountInfo::new(&key, false, false, &mut lamports, &mut data, &owner, false, 0);
        require_whitelisted(mint, &info)
    }

    #[test]
    fn test_whitelist_entry_accepted() {
        let mint = Pubkey::new_unique();
        let (pda, _) = Pubkey::find_program_address(&[WHITELIST_SEED, mint.as_ref()], &crate::ID);
        assert!(check(&mint, pda, crate::ID, entry_data(mint)).is_ok());
    }

    #[test]
    fn test_whitelist_entry_rejections() {
        let mint = Pubkey::new_unique();
        let (pda, _) = Pubkey::find_program_address(&[WHITELIST_SEED, mint.as_ref()], &crate::ID);
        let not_whitelisted = Error::from(StrategyError::NotWhitelisted);

        // entry for another mint at the wrong address
        let other = Pubkey::new_unique();
        let (other_pda, _) = Pubkey::find_program_address(&[WHITELIST_SEED, other.as_ref()], &crate::ID);
        assert_eq!(check(&mint, other_pda, crate::ID, entry_data(other)).unwrap_err(), not_whitelisted);

        // right address, foreign owner
        assert_eq!(
            check(&mint, pda, Pubkey::new_unique(), entry_data(mint)).unwrap_err(),
            not_whitelisted
        );

        // closed entry
        assert_eq!(check(&mint, pda, crate::ID, Vec::new()).unwrap_err(), not_whitelisted);

        // stored mint differs
        assert_eq!(check(&mint, pda, crate::ID, entry_data(other)).unwrap_err(), not_whitelisted);
    }

    #[test]
    fn test_move_lamports_is_checked() {
        let (a, b, owner) = (Pubkey::new_unique(), Pubkey::new_unique(), Pubkey::new_unique());
        let (mut la, mut lb) = (1_000u64, 5u64);
        let (mut da, mut db) = (Vec::<u8>::new(), Vec::<u8>::new());
        let from = AccountInfo::new(&a, false, true, &mut la, &mut da, &owner, false, 0);
        let to = AccountInfo::new(&b, false, true, &mut lb, &mut db, &owner, false, 0);

        move_lamports(&from, &to, 400).unwrap();
        assert_eq!((from.lamports(), to.lamports()), (600, 405));

        assert_eq!(
            move_lamports(&from, &to, 601).unwrap_err(),
            Error::from(StrategyError::InsufficientTreasury)
        );
        assert_eq!((from.lamports(), to.lamports()), (600, 405));
    }

    #[test]
    fn test_account_window() {
        let keys: Vec<Pubkey> = (0..5).map(|_| Pubkey::new_unique()).collect();
        let owner = Pubkey::new_unique();
        let mut lamports = vec![0u64; 5];
        let mut data: Vec<Vec<u8>> = vec![Vec::new(); 5];
        let infos: Vec<AccountInfo> = keys
            .iter()
            .zip(lamports.iter_mut())
            .zip(data.iter_mut())
            .map(|((k, l), d)| AccountInfo::new(k, false, false, l, d, &owner, false, 0))
            .collect();

        let window = account_window::<3>(&infos, 2).unwrap();
        assert_eq!(window[0].key(), keys[2]);
        assert_eq!(window[2].key(), keys[4]);
        assert_eq!(
            account_window::<3>(&infos, 3).unwrap_err(),
            Error::from(StrategyError::MissingAccounts)
        );
    }
}
