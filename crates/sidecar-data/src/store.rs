//! SQLite storage for blocks, decoded logs, contracts and derived state.
//!
//! Uses WAL mode and enforces foreign keys so deleting a block cascades to
//! its transactions and logs. The connection sits behind a mutex so one
//! `Arc<Store>` can be shared with worker tasks.

use eyre::{eyre, Context, Result};
use rusqlite::{Connection, OptionalExtension};
use std::sync::{Mutex, MutexGuard};

use crate::types::{
    ActiveAvsOperator, Block, Contract, ContractsTree, LogArgument, OperatorRestakedStrategy,
    ProxyContract, StateRoot, Transaction, TransactionLog,
};

/// Tables that hold derived state and may be purged by block range.
pub const STATE_TABLES: &[&str] = &[
    "avs_operator_state_changes",
    "staker_delegation_changes",
    "operator_share_changes",
    "submitted_distribution_roots",
    "rewards_claimed",
    "staker_share_deltas",
    "reward_submissions",
    "disabled_distribution_roots",
    "operator_restaked_strategies",
];

/// Whether `err` is a UNIQUE or PRIMARY KEY constraint failure.
pub fn is_duplicate_key_error(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(failure, _) => {
            failure.code == rusqlite::ErrorCode::ConstraintViolation
                && (failure.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                    || failure.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY)
        }
        _ => false,
    }
}

/// Same as [`is_duplicate_key_error`] for a wrapped report.
pub fn is_duplicate_key_report(err: &eyre::Report) -> bool {
    err.downcast_ref::<rusqlite::Error>()
        .is_some_and(is_duplicate_key_error)
}

pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Creates or opens a SQLite database with WAL mode enabled.
    ///
    /// # Errors
    /// Returns error if the database cannot be opened or migrations fail.
    pub fn new(path: &str) -> Result<Self> {
        let conn = Connection::open(path)
            .wrap_err_with(|| format!("failed to open database at {path}"))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.run_migrations()?;
        Ok(store)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| eyre!("database connection mutex poisoned"))
    }

    fn run_migrations(&self) -> Result<()> {
        self.lock()?.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS blocks (
                number INTEGER PRIMARY KEY,
                hash TEXT NOT NULL,
                parent_hash TEXT NOT NULL,
                block_time INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS transactions (
                block_number INTEGER NOT NULL REFERENCES blocks(number) ON DELETE CASCADE,
                transaction_hash TEXT NOT NULL,
                transaction_index INTEGER NOT NULL,
                from_address TEXT NOT NULL,
                to_address TEXT,
                contract_address TEXT,
                bytecode_hash TEXT,
                PRIMARY KEY (block_number, transaction_hash)
            );

            CREATE TABLE IF NOT EXISTS transaction_logs (
                transaction_hash TEXT NOT NULL,
                transaction_index INTEGER NOT NULL,
                log_index INTEGER NOT NULL,
                block_number INTEGER NOT NULL REFERENCES blocks(number) ON DELETE CASCADE,
                address TEXT NOT NULL,
                event_name TEXT NOT NULL,
                arguments TEXT NOT NULL,
                output_data TEXT NOT NULL,
                UNIQUE (transaction_hash, log_index, block_number)
            );
            CREATE INDEX IF NOT EXISTS idx_transaction_logs_address_event
                ON transaction_logs (address, event_name, block_number);

            CREATE TABLE IF NOT EXISTS contracts (
                contract_address TEXT PRIMARY KEY,
                contract_abi TEXT NOT NULL DEFAULT '',
                verified INTEGER NOT NULL DEFAULT 0,
                bytecode_hash TEXT NOT NULL DEFAULT '',
                matching_contract_address TEXT NOT NULL DEFAULT '',
                checked_for_abi INTEGER NOT NULL DEFAULT 0,
                checked_for_proxy INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_contracts_bytecode_hash ON contracts (bytecode_hash);

            CREATE TABLE IF NOT EXISTS proxy_contracts (
                block_number INTEGER NOT NULL,
                contract_address TEXT NOT NULL REFERENCES contracts(contract_address),
                proxy_contract_address TEXT NOT NULL REFERENCES contracts(contract_address),
                UNIQUE (contract_address, block_number)
            );

            CREATE TABLE IF NOT EXISTS state_roots (
                eth_block_number INTEGER NOT NULL,
                eth_block_hash TEXT NOT NULL UNIQUE,
                state_root TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS operator_restaked_strategies (
                block_number INTEGER NOT NULL,
                block_time TEXT NOT NULL,
                avs_directory_address TEXT NOT NULL,
                operator TEXT NOT NULL,
                avs TEXT NOT NULL,
                strategy TEXT NOT NULL,
                UNIQUE (block_number, operator, avs, strategy)
            );

            CREATE TABLE IF NOT EXISTS avs_operator_state_changes (
                operator TEXT NOT NULL,
                avs TEXT NOT NULL,
                registered INTEGER NOT NULL,
                transaction_hash TEXT NOT NULL,
                log_index INTEGER NOT NULL,
                block_number INTEGER NOT NULL,
                UNIQUE (transaction_hash, log_index, block_number)
            );

            CREATE TABLE IF NOT EXISTS staker_delegation_changes (
                staker TEXT NOT NULL,
                operator TEXT NOT NULL,
                delegated INTEGER NOT NULL,
                transaction_hash TEXT NOT NULL,
                log_index INTEGER NOT NULL,
                block_number INTEGER NOT NULL,
                UNIQUE (transaction_hash, log_index, block_number)
            );

            CREATE TABLE IF NOT EXISTS operator_share_changes (
                operator TEXT NOT NULL,
                staker TEXT NOT NULL,
                strategy TEXT NOT NULL,
                shares TEXT NOT NULL,
                transaction_hash TEXT NOT NULL,
                log_index INTEGER NOT NULL,
                block_number INTEGER NOT NULL,
                UNIQUE (transaction_hash, log_index, block_number)
            );

            CREATE TABLE IF NOT EXISTS submitted_distribution_roots (
                root TEXT NOT NULL,
                root_index INTEGER NOT NULL,
                rewards_calculation_end INTEGER NOT NULL,
                rewards_calculation_end_unit TEXT NOT NULL,
                activated_at INTEGER NOT NULL,
                activated_at_unit TEXT NOT NULL,
                created_at_block_number INTEGER NOT NULL,
                transaction_hash TEXT NOT NULL,
                log_index INTEGER NOT NULL,
                block_number INTEGER NOT NULL,
                UNIQUE (transaction_hash, log_index, block_number)
            );

            CREATE TABLE IF NOT EXISTS rewards_claimed (
                root TEXT NOT NULL,
                earner TEXT NOT NULL,
                claimer TEXT NOT NULL,
                recipient TEXT NOT NULL,
                token TEXT NOT NULL,
                claimed_amount TEXT NOT NULL,
                transaction_hash TEXT NOT NULL,
                log_index INTEGER NOT NULL,
                block_number INTEGER NOT NULL,
                UNIQUE (transaction_hash, log_index, block_number)
            );

            CREATE TABLE IF NOT EXISTS staker_share_deltas (
                staker TEXT NOT NULL,
                strategy TEXT NOT NULL,
                shares TEXT NOT NULL,
                strategy_index INTEGER NOT NULL,
                transaction_hash TEXT NOT NULL,
                log_index INTEGER NOT NULL,
                block_number INTEGER NOT NULL,
                UNIQUE (transaction_hash, log_index, strategy_index, block_number)
            );

            CREATE TABLE IF NOT EXISTS reward_submissions (
                avs TEXT NOT NULL,
                reward_hash TEXT NOT NULL,
                token TEXT NOT NULL,
                amount TEXT NOT NULL,
                strategy TEXT NOT NULL,
                strategy_index INTEGER NOT NULL,
                multiplier TEXT NOT NULL,
                start_timestamp INTEGER NOT NULL,
                end_timestamp INTEGER NOT NULL,
                duration INTEGER NOT NULL,
                reward_type TEXT NOT NULL,
                transaction_hash TEXT NOT NULL,
                log_index INTEGER NOT NULL,
                block_number INTEGER NOT NULL,
                UNIQUE (transaction_hash, log_index, strategy_index, block_number)
            );

            CREATE TABLE IF NOT EXISTS disabled_distribution_roots (
                root_index INTEGER NOT NULL,
                transaction_hash TEXT NOT NULL,
                log_index INTEGER NOT NULL,
                block_number INTEGER NOT NULL,
                UNIQUE (transaction_hash, log_index, block_number)
            );
            ",
        )?;
        Ok(())
    }

    /// Runs `f` inside a transaction, committing only if it succeeds.
    ///
    /// # Errors
    /// Returns the error from `f` or from committing.
    pub fn with_transaction<T>(
        &self,
        f: impl FnOnce(&rusqlite::Transaction<'_>) -> Result<T>,
    ) -> Result<T> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    /// Runs a read-only closure against the connection.
    ///
    /// # Errors
    /// Returns the error from `f`.
    pub fn with_connection<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.lock()?;
        f(&conn)
    }

    // ---- blocks ----

    /// Insert a single block.
    ///
    /// # Errors
    /// Returns error if the block already exists or the insert fails.
    pub fn insert_block(&self, block: &Block) -> Result<()> {
        self.lock()?.execute(
            "INSERT INTO blocks (number, hash, parent_hash, block_time) VALUES (?, ?, ?, ?)",
            rusqlite::params![block.number, block.hash, block.parent_hash, block.block_time],
        )?;
        Ok(())
    }

    pub fn get_block_by_number(&self, number: u64) -> Result<Option<Block>> {
        let block = self
            .lock()?
            .query_row(
                "SELECT number, hash, parent_hash, block_time FROM blocks WHERE number = ?",
                [number],
                |row| {
                    Ok(Block {
                        number: row.get(0)?,
                        hash: row.get(1)?,
                        parent_hash: row.get(2)?,
                        block_time: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(block)
    }

    pub fn get_latest_block(&self) -> Result<Option<u64>> {
        let latest = self
            .lock()?
            .query_row("SELECT MAX(number) FROM blocks", [], |row| row.get(0))?;
        Ok(latest)
    }

    /// Deletes blocks `>= start` (and `<= end` when `end != 0`), cascading
    /// to their transactions and logs.
    ///
    /// # Errors
    /// Returns error if the range is inverted or the delete fails.
    pub fn delete_blocks(&self, start: u64, end: u64) -> Result<usize> {
        check_range(start, end)?;
        let conn = self.lock()?;
        let deleted = if end == 0 {
            conn.execute("DELETE FROM blocks WHERE number >= ?", [start])?
        } else {
            conn.execute(
                "DELETE FROM blocks WHERE number >= ? AND number <= ?",
                [start, end],
            )?
        };
        Ok(deleted)
    }

    /// Deletes exactly one block, cascading to its transactions and logs.
    pub fn delete_block(&self, number: u64) -> Result<bool> {
        let deleted = self
            .lock()?
            .execute("DELETE FROM blocks WHERE number = ?", [number])?;
        Ok(deleted > 0)
    }

    // ---- transactions ----

    /// Batch insert transactions using a prepared statement and transaction.
    ///
    /// # Errors
    /// Returns error if database insert fails.
    pub fn insert_transactions(&self, txs: &[Transaction]) -> Result<usize> {
        self.with_transaction(|tx| {
            let mut stmt = tx.prepare(
                "
                INSERT INTO transactions (
                    block_number, transaction_hash, transaction_index, from_address,
                    to_address, contract_address, bytecode_hash
                ) VALUES (?, ?, ?, ?, ?, ?, ?)
                ",
            )?;
            for t in txs {
                stmt.execute(rusqlite::params![
                    t.block_number,
                    t.transaction_hash,
                    t.transaction_index,
                    t.from_address,
                    t.to_address,
                    t.contract_address,
                    t.bytecode_hash,
                ])?;
            }
            Ok(txs.len())
        })
    }

    /// Insert one transaction, leaving an existing row untouched.
    ///
    /// Returns whether a row was written.
    pub fn insert_transaction(&self, t: &Transaction) -> Result<bool> {
        let changed = self.lock()?.execute(
            "
            INSERT OR IGNORE INTO transactions (
                block_number, transaction_hash, transaction_index, from_address,
                to_address, contract_address, bytecode_hash
            ) VALUES (?, ?, ?, ?, ?, ?, ?)
            ",
            rusqlite::params![
                t.block_number,
                t.transaction_hash,
                t.transaction_index,
                t.from_address,
                t.to_address,
                t.contract_address,
                t.bytecode_hash,
            ],
        )?;
        Ok(changed > 0)
    }

    pub fn get_transactions_for_block(&self, block_number: u64) -> Result<Vec<Transaction>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "
            SELECT block_number, transaction_hash, transaction_index, from_address,
                   to_address, contract_address, bytecode_hash
            FROM transactions WHERE block_number = ? ORDER BY transaction_index
            ",
        )?;
        let rows = stmt
            .query_map([block_number], |row| {
                Ok(Transaction {
                    block_number: row.get(0)?,
                    transaction_hash: row.get(1)?,
                    transaction_index: row.get(2)?,
                    from_address: row.get(3)?,
                    to_address: row.get(4)?,
                    contract_address: row.get(5)?,
                    bytecode_hash: row.get(6)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ---- transaction logs ----

    /// Batch insert decoded logs.
    ///
    /// # Errors
    /// Returns error if serialization or the insert fails.
    pub fn insert_transaction_logs(&self, logs: &[TransactionLog]) -> Result<usize> {
        self.with_transaction(|tx| {
            let mut stmt = tx.prepare(
                "
                INSERT INTO transaction_logs (
                    transaction_hash, transaction_index, log_index, block_number,
                    address, event_name, arguments, output_data
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                ",
            )?;
            for log in logs {
                stmt.execute(rusqlite::params![
                    log.transaction_hash,
                    log.transaction_index,
                    log.log_index,
                    log.block_number,
                    log.address,
                    log.event_name,
                    serde_json::to_string(&log.arguments)?,
                    serde_json::to_string(&log.output_data)?,
                ])?;
            }
            Ok(logs.len())
        })
    }

    /// Logs of a block in (transaction, log) order.
    pub fn get_transaction_logs_for_block(&self, block_number: u64) -> Result<Vec<TransactionLog>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "
            SELECT transaction_hash, transaction_index, log_index, block_number,
                   address, event_name, arguments, output_data
            FROM transaction_logs WHERE block_number = ?
            ORDER BY transaction_index, log_index
            ",
        )?;
        let raw = stmt
            .query_map([block_number], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, u64>(1)?,
                    row.get::<_, u64>(2)?,
                    row.get::<_, u64>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                    row.get::<_, String>(7)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        raw.into_iter()
            .map(
                |(transaction_hash, transaction_index, log_index, block_number, address, event_name, arguments, output_data)| {
                    let arguments: Vec<LogArgument> = serde_json::from_str(&arguments)
                        .wrap_err("stored log arguments are not valid JSON")?;
                    let output_data = serde_json::from_str(&output_data)
                        .wrap_err("stored log output data is not valid JSON")?;
                    Ok(TransactionLog {
                        block_number,
                        transaction_hash,
                        transaction_index,
                        log_index,
                        address,
                        event_name,
                        arguments,
                        output_data,
                    })
                },
            )
            .collect()
    }

    // ---- contracts ----

    pub fn get_contract(&self, address: &str) -> Result<Option<Contract>> {
        let contract = self
            .lock()?
            .query_row(
                "
                SELECT contract_address, contract_abi, verified, bytecode_hash,
                       matching_contract_address, checked_for_abi, checked_for_proxy
                FROM contracts WHERE contract_address = ?
                ",
                [address.to_lowercase()],
                contract_from_row,
            )
            .optional()?;
        Ok(contract)
    }

    /// Finds the contract at `address`, creating an empty record if unseen.
    ///
    /// An existing record with no bytecode hash is given `bytecode_hash`.
    pub fn find_or_create_contract(&self, address: &str, bytecode_hash: &str) -> Result<Contract> {
        let address = address.to_lowercase();
        {
            let conn = self.lock()?;
            conn.execute(
                "INSERT OR IGNORE INTO contracts (contract_address, bytecode_hash) VALUES (?, ?)",
                rusqlite::params![address, bytecode_hash],
            )?;
            if !bytecode_hash.is_empty() {
                conn.execute(
                    "UPDATE contracts SET bytecode_hash = ? WHERE contract_address = ? AND bytecode_hash = ''",
                    rusqlite::params![bytecode_hash, address],
                )?;
            }
        }
        self.get_contract(&address)?
            .ok_or_else(|| eyre!("contract {address} missing after insert"))
    }

    /// Records the ABI lookup result; always marks the contract as checked.
    pub fn set_contract_abi(&self, address: &str, abi: &str, verified: bool) -> Result<()> {
        self.lock()?.execute(
            "UPDATE contracts SET contract_abi = ?, verified = ?, checked_for_abi = 1 WHERE contract_address = ?",
            rusqlite::params![abi, verified, address.to_lowercase()],
        )?;
        Ok(())
    }

    pub fn set_contract_checked_for_proxy(&self, address: &str) -> Result<()> {
        self.lock()?.execute(
            "UPDATE contracts SET checked_for_proxy = 1 WHERE contract_address = ?",
            [address.to_lowercase()],
        )?;
        Ok(())
    }

    pub fn set_contract_matching_address(&self, address: &str, matching: &str) -> Result<()> {
        self.lock()?.execute(
            "UPDATE contracts SET matching_contract_address = ? WHERE contract_address = ?",
            rusqlite::params![matching.to_lowercase(), address.to_lowercase()],
        )?;
        Ok(())
    }

    /// Oldest verified, unmatched contract sharing `bytecode_hash`, other
    /// than `exclude_address`.
    pub fn find_verified_contract_with_matching_bytecode_hash(
        &self,
        bytecode_hash: &str,
        exclude_address: &str,
    ) -> Result<Option<Contract>> {
        let contract = self
            .lock()?
            .query_row(
                "
                SELECT contract_address, contract_abi, verified, bytecode_hash,
                       matching_contract_address, checked_for_abi, checked_for_proxy
                FROM contracts
                WHERE bytecode_hash = ?
                  AND verified = 1
                  AND matching_contract_address = ''
                  AND contract_address != ?
                ORDER BY rowid ASC
                LIMIT 1
                ",
                rusqlite::params![bytecode_hash, exclude_address.to_lowercase()],
                contract_from_row,
            )
            .optional()?;
        Ok(contract)
    }

    // ---- proxy contracts ----

    /// Records that `contract_address` delegates to `proxy_contract_address`
    /// from `block_number`. An existing row for the same block wins.
    pub fn find_or_create_proxy_contract(
        &self,
        block_number: u64,
        contract_address: &str,
        proxy_contract_address: &str,
    ) -> Result<ProxyContract> {
        let contract_address = contract_address.to_lowercase();
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR IGNORE INTO proxy_contracts (block_number, contract_address, proxy_contract_address) VALUES (?, ?, ?)",
            rusqlite::params![block_number, contract_address, proxy_contract_address.to_lowercase()],
        )?;
        let proxy = conn.query_row(
            "SELECT block_number, contract_address, proxy_contract_address FROM proxy_contracts WHERE contract_address = ? AND block_number = ?",
            rusqlite::params![contract_address, block_number],
            proxy_from_row,
        )?;
        Ok(proxy)
    }

    /// The delegation in force for `address` at `block_number`.
    pub fn get_proxy_contract_at(&self, address: &str, block_number: u64) -> Result<Option<ProxyContract>> {
        let proxy = self
            .lock()?
            .query_row(
                "
                SELECT block_number, contract_address, proxy_contract_address
                FROM proxy_contracts
                WHERE contract_address = ? AND block_number <= ?
                ORDER BY block_number DESC
                LIMIT 1
                ",
                rusqlite::params![address.to_lowercase(), block_number],
                proxy_from_row,
            )
            .optional()?;
        Ok(proxy)
    }

    pub fn count_proxy_contracts(&self, address: &str) -> Result<u64> {
        let count = self.lock()?.query_row(
            "SELECT COUNT(*) FROM proxy_contracts WHERE contract_address = ?",
            [address.to_lowercase()],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Joins a contract with its implementation at `block_number` and the
    /// lookalikes of both.
    pub fn get_contract_with_proxy_contract(
        &self,
        address: &str,
        block_number: u64,
    ) -> Result<Option<ContractsTree>> {
        let tree = self
            .lock()?
            .query_row(
                "
                WITH proxy AS (
                    SELECT proxy_contract_address
                    FROM proxy_contracts
                    WHERE contract_address = ?1 AND block_number <= ?2
                    ORDER BY block_number DESC
                    LIMIT 1
                )
                SELECT
                    c.contract_address, c.contract_abi,
                    pcc.contract_address, pcc.contract_abi,
                    pcclike.contract_address, pcclike.contract_abi,
                    clike.contract_address, clike.contract_abi
                FROM contracts AS c
                LEFT JOIN proxy AS p ON 1 = 1
                LEFT JOIN contracts AS pcc
                    ON pcc.contract_address = p.proxy_contract_address
                LEFT JOIN contracts AS pcclike
                    ON pcc.matching_contract_address != ''
                    AND pcclike.contract_address = pcc.matching_contract_address
                LEFT JOIN contracts AS clike
                    ON c.matching_contract_address != ''
                    AND clike.contract_address = c.matching_contract_address
                WHERE c.contract_address = ?1
                ",
                rusqlite::params![address.to_lowercase(), block_number],
                |row| {
                    let text = |idx: usize| -> rusqlite::Result<String> {
                        Ok(row.get::<_, Option<String>>(idx)?.unwrap_or_default())
                    };
                    Ok(ContractsTree {
                        base_address: text(0)?,
                        base_abi: text(1)?,
                        base_proxy_address: text(2)?,
                        base_proxy_abi: text(3)?,
                        base_proxy_like_address: text(4)?,
                        base_proxy_like_abi: text(5)?,
                        base_like_address: text(6)?,
                        base_like_abi: text(7)?,
                    })
                },
            )
            .optional()?;
        Ok(tree)
    }

    // ---- state roots ----

    pub fn insert_state_root(&self, root: &StateRoot) -> Result<()> {
        self.lock()?.execute(
            "INSERT INTO state_roots (eth_block_number, eth_block_hash, state_root) VALUES (?, ?, ?)",
            rusqlite::params![root.eth_block_number, root.eth_block_hash, root.state_root],
        )?;
        Ok(())
    }

    pub fn get_state_root_for_block(&self, block_number: u64) -> Result<Option<StateRoot>> {
        let root = self
            .lock()?
            .query_row(
                "SELECT eth_block_number, eth_block_hash, state_root FROM state_roots WHERE eth_block_number = ?",
                [block_number],
                state_root_from_row,
            )
            .optional()?;
        Ok(root)
    }

    pub fn get_state_roots(&self, start: u64, end: u64) -> Result<Vec<StateRoot>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "
            SELECT eth_block_number, eth_block_hash, state_root FROM state_roots
            WHERE eth_block_number >= ? AND eth_block_number <= ?
            ORDER BY eth_block_number
            ",
        )?;
        let roots = stmt
            .query_map([start, end], state_root_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(roots)
    }

    pub fn delete_state_roots(&self, start: u64, end: u64) -> Result<usize> {
        check_range(start, end)?;
        let conn = self.lock()?;
        let deleted = if end == 0 {
            conn.execute("DELETE FROM state_roots WHERE eth_block_number >= ?", [start])?
        } else {
            conn.execute(
                "DELETE FROM state_roots WHERE eth_block_number >= ? AND eth_block_number <= ?",
                [start, end],
            )?
        };
        Ok(deleted)
    }

    /// Deletes the state root of exactly `block_number`, block 0 included.
    pub fn delete_state_root_at(&self, block_number: u64) -> Result<usize> {
        let deleted = self
            .lock()?
            .execute("DELETE FROM state_roots WHERE eth_block_number = ?", [block_number])?;
        Ok(deleted)
    }

    // ---- restaked strategies ----

    /// Inserts one restaked strategy row. Returns `false` when the same
    /// `(block, operator, avs, strategy)` already exists.
    pub fn insert_operator_restaked_strategy(&self, row: &OperatorRestakedStrategy) -> Result<bool> {
        let changed = self.lock()?.execute(
            "
            INSERT OR IGNORE INTO operator_restaked_strategies (
                block_number, block_time, avs_directory_address, operator, avs, strategy
            ) VALUES (?, ?, ?, ?, ?, ?)
            ",
            rusqlite::params![
                row.block_number,
                row.block_time,
                row.avs_directory_address.to_lowercase(),
                row.operator.to_lowercase(),
                row.avs.to_lowercase(),
                row.strategy.to_lowercase(),
            ],
        )?;
        Ok(changed > 0)
    }

    pub fn get_operator_restaked_strategies(&self, block_number: u64) -> Result<Vec<OperatorRestakedStrategy>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "
            SELECT block_number, block_time, avs_directory_address, operator, avs, strategy
            FROM operator_restaked_strategies WHERE block_number = ?
            ORDER BY avs, operator, strategy
            ",
        )?;
        let rows = stmt
            .query_map([block_number], |row| {
                Ok(OperatorRestakedStrategy {
                    block_number: row.get(0)?,
                    block_time: row.get(1)?,
                    avs_directory_address: row.get(2)?,
                    operator: row.get(3)?,
                    avs: row.get(4)?,
                    strategy: row.get(5)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// (avs, operator) pairs whose most recent registration event at or
    /// before `block_number` in `avs_directory` set status 1.
    pub fn get_latest_active_avs_operators(
        &self,
        block_number: u64,
        avs_directory: &str,
    ) -> Result<Vec<ActiveAvsOperator>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "
            WITH latest_status AS (
                SELECT
                    lower(json_extract(tl.arguments, '$[0].value')) AS operator,
                    lower(json_extract(tl.arguments, '$[1].value')) AS avs,
                    CAST(json_extract(tl.output_data, '$.status') AS TEXT) AS status,
                    ROW_NUMBER() OVER (
                        PARTITION BY
                            lower(json_extract(tl.arguments, '$[0].value')),
                            lower(json_extract(tl.arguments, '$[1].value'))
                        ORDER BY tl.block_number DESC, tl.log_index DESC
                    ) AS rn
                FROM transaction_logs AS tl
                WHERE tl.address = ?
                  AND tl.event_name = 'OperatorAVSRegistrationStatusUpdated'
                  AND tl.block_number <= ?
            )
            SELECT avs, operator
            FROM latest_status
            WHERE rn = 1 AND status = '1' AND avs IS NOT NULL AND operator IS NOT NULL
            ORDER BY avs, operator
            ",
        )?;
        let rows = stmt
            .query_map(
                rusqlite::params![avs_directory.to_lowercase(), block_number],
                |row| {
                    Ok(ActiveAvsOperator {
                        avs: row.get(0)?,
                        operator: row.get(1)?,
                    })
                },
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ---- derived state ----

    /// Deletes rows of a state table with `block_number >= start` and, when
    /// `end != 0`, `block_number <= end`.
    ///
    /// # Errors
    /// Returns error if `table` is not a state table, the range is
    /// inverted, or the delete fails.
    pub fn delete_state(&self, table: &str, start: u64, end: u64) -> Result<usize> {
        if !STATE_TABLES.contains(&table) {
            return Err(eyre!("'{table}' is not a state table"));
        }
        check_range(start, end)?;

        let mut query = format!("DELETE FROM {table} WHERE block_number >= ?1");
        if end > 0 {
            query.push_str(" AND block_number <= ?2");
        }
        let conn = self.lock()?;
        let deleted = if end > 0 {
            conn.execute(&query, [start, end])?
        } else {
            conn.execute(&query, [start])?
        };
        tracing::debug!(table, start, end, deleted, "deleted state");
        Ok(deleted)
    }

    /// Deletes the rows of `table` committed at exactly `block_number`.
    pub fn delete_state_at(&self, table: &str, block_number: u64) -> Result<usize> {
        if !STATE_TABLES.contains(&table) {
            return Err(eyre!("'{table}' is not a state table"));
        }
        let deleted = self
            .lock()?
            .execute(&format!("DELETE FROM {table} WHERE block_number = ?"), [block_number])?;
        tracing::debug!(table, block_number, deleted, "deleted block state");
        Ok(deleted)
    }

    pub fn count_rows(&self, table: &str, block_number: u64) -> Result<u64> {
        if !STATE_TABLES.contains(&table) && table != "transactions" && table != "transaction_logs" {
            return Err(eyre!("'{table}' cannot be counted"));
        }
        let count = self.lock()?.query_row(
            &format!("SELECT COUNT(*) FROM {table} WHERE block_number = ?"),
            [block_number],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}

fn check_range(start: u64, end: u64) -> Result<()> {
    if end != 0 && end < start {
        return Err(eyre!(
            "invalid block range; end block {end} must be greater than or equal to start block {start}"
        ));
    }
    Ok(())
}

fn contract_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Contract> {
    Ok(Contract {
        contract_address: row.get(0)?,
        contract_abi: row.get(1)?,
        verified: row.get(2)?,
        bytecode_hash: row.get(3)?,
        matching_contract_address: row.get(4)?,
        checked_for_abi: row.get(5)?,
        checked_for_proxy: row.get(6)?,
    })
}

fn proxy_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ProxyContract> {
    Ok(ProxyContract {
        block_number: row.get(0)?,
        contract_address: row.get(1)?,
        proxy_contract_address: row.get(2)?,
    })
}

fn state_root_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<StateRoot> {
    Ok(StateRoot {
        eth_block_number: row.get(0)?,
        eth_block_hash: row.get(1)?,
        state_root: row.get(2)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_block(number: u64) -> Block {
        Block {
            number,
            hash: format!("0x{number:064x}"),
            parent_hash: format!("0x{:064x}", number.saturating_sub(1)),
            block_time: 1_700_000_000 + number * 12,
        }
    }

    fn registration_log(block_number: u64, log_index: u64, operator: &str, avs: &str, status: u64) -> TransactionLog {
        TransactionLog {
            block_number,
            transaction_hash: format!("0xtx{block_number}_{log_index}"),
            transaction_index: 0,
            log_index,
            address: "0xdirectory".to_string(),
            event_name: "OperatorAVSRegistrationStatusUpdated".to_string(),
            arguments: vec![
                LogArgument {
                    name: "operator".to_string(),
                    kind: "address".to_string(),
                    value: json!(operator),
                    indexed: true,
                },
                LogArgument {
                    name: "avs".to_string(),
                    kind: "address".to_string(),
                    value: json!(avs),
                    indexed: true,
                },
            ],
            output_data: json!({ "status": status.to_string() })
                .as_object()
                .cloned()
                .unwrap_or_default(),
        }
    }

    #[test]
    fn migrations_create_tables() {
        let store = Store::new(":memory:").expect("in-memory store should always open");
        let tables: Vec<String> = store
            .with_connection(|conn| {
                let mut stmt = conn
                    .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")?;
                let names = stmt
                    .query_map([], |row| row.get(0))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(names)
            })
            .expect("query should succeed");

        for table in ["blocks", "contracts", "proxy_contracts", "state_roots", "transaction_logs", "transactions"] {
            assert!(tables.contains(&table.to_string()), "missing {table}");
        }
        for table in STATE_TABLES {
            assert!(tables.contains(&table.to_string()), "missing {table}");
        }
    }

    #[test]
    fn deleting_a_block_cascades_to_logs() {
        let store = Store::new(":memory:").expect("in-memory store should always open");
        store.insert_block(&sample_block(100)).expect("insert block");
        store
            .insert_transactions(&[Transaction {
                block_number: 100,
                transaction_hash: "0xtx100_0".to_string(),
                transaction_index: 0,
                from_address: "0xfrom".to_string(),
                to_address: Some("0xdirectory".to_string()),
                contract_address: None,
                bytecode_hash: None,
            }])
            .expect("insert tx");
        store
            .insert_transaction_logs(&[registration_log(100, 0, "0xop", "0xavs", 1)])
            .expect("insert log");

        assert_eq!(store.delete_blocks(100, 100).expect("delete"), 1);
        assert!(store.get_block_by_number(100).expect("query").is_none());
        assert_eq!(store.count_rows("transactions", 100).expect("count"), 0);
        assert_eq!(store.count_rows("transaction_logs", 100).expect("count"), 0);
    }

    #[test]
    fn duplicate_block_is_a_duplicate_key_error() {
        let store = Store::new(":memory:").expect("in-memory store should always open");
        store.insert_block(&sample_block(1)).expect("first insert");
        let err = store.insert_block(&sample_block(1)).expect_err("second insert");
        assert!(is_duplicate_key_report(&err));
    }

    #[test]
    fn logs_round_trip_arguments() {
        let store = Store::new(":memory:").expect("in-memory store should always open");
        store.insert_block(&sample_block(7)).expect("insert block");
        let log = registration_log(7, 3, "0xOp", "0xAvs", 1);
        store
            .insert_transaction_logs(std::slice::from_ref(&log))
            .expect("insert log");

        let logs = store.get_transaction_logs_for_block(7).expect("query");
        assert_eq!(logs, vec![log]);
    }

    #[test]
    fn lookalike_query_prefers_oldest_verified() {
        let store = Store::new(":memory:").expect("in-memory store should always open");
        for address in ["0xa", "0xb", "0xc"] {
            store.find_or_create_contract(address, "hash").expect("create");
        }
        store.set_contract_abi("0xb", "[]", true).expect("verify b");
        store.set_contract_abi("0xc", "[]", true).expect("verify c");

        let found = store
            .find_verified_contract_with_matching_bytecode_hash("hash", "0xa")
            .expect("query")
            .expect("a match exists");
        assert_eq!(found.contract_address, "0xb");

        store.set_contract_matching_address("0xb", "0xc").expect("match b");
        let found = store
            .find_verified_contract_with_matching_bytecode_hash("hash", "0xa")
            .expect("query")
            .expect("c still matches");
        assert_eq!(found.contract_address, "0xc");
    }

    #[test]
    fn contract_tree_uses_latest_proxy_at_block() {
        let store = Store::new(":memory:").expect("in-memory store should always open");
        store.find_or_create_contract("0xproxy", "").expect("proxy");
        store.find_or_create_contract("0ximpl1", "").expect("impl1");
        store.find_or_create_contract("0ximpl2", "").expect("impl2");
        store.set_contract_abi("0ximpl1", "[1]", true).expect("abi");
        store.set_contract_abi("0ximpl2", "[2]", true).expect("abi");
        store.find_or_create_proxy_contract(10, "0xproxy", "0ximpl1").expect("p1");
        store.find_or_create_proxy_contract(20, "0xproxy", "0ximpl2").expect("p2");

        let at = |block| {
            store
                .get_contract_with_proxy_contract("0xproxy", block)
                .expect("query")
                .expect("tree")
        };
        assert_eq!(at(5).base_proxy_address, "");
        assert_eq!(at(15).base_proxy_address, "0ximpl1");
        assert_eq!(at(25).base_proxy_abi, "[2]");
        assert!(store
            .get_contract_with_proxy_contract("0xunknown", 25)
            .expect("query")
            .is_none());
    }

    #[test]
    fn restaked_strategy_duplicates_are_ignored() {
        let store = Store::new(":memory:").expect("in-memory store should always open");
        let row = OperatorRestakedStrategy {
            block_number: 3600,
            block_time: "2024-01-01T00:00:00+00:00".to_string(),
            avs_directory_address: "0xdir".to_string(),
            operator: "0xop".to_string(),
            avs: "0xavs".to_string(),
            strategy: "0xstrat".to_string(),
        };
        assert!(store.insert_operator_restaked_strategy(&row).expect("first"));
        assert!(!store.insert_operator_restaked_strategy(&row).expect("duplicate"));
        assert_eq!(store.get_operator_restaked_strategies(3600).expect("query").len(), 1);
    }

    #[test]
    fn active_avs_operators_use_latest_status() {
        let store = Store::new(":memory:").expect("in-memory store should always open");
        for n in [1, 2, 3] {
            store.insert_block(&sample_block(n)).expect("block");
        }
        store
            .insert_transaction_logs(&[
                registration_log(1, 0, "0xop1", "0xavs", 1),
                registration_log(1, 1, "0xop2", "0xavs", 1),
                registration_log(2, 0, "0xop1", "0xavs", 0),
                registration_log(3, 0, "0xop3", "0xavs", 1),
            ])
            .expect("logs");

        let active = store
            .get_latest_active_avs_operators(2, "0xDIRECTORY")
            .expect("query");
        assert_eq!(
            active,
            vec![ActiveAvsOperator {
                avs: "0xavs".to_string(),
                operator: "0xop2".to_string(),
            }]
        );
    }

    #[test]
    fn delete_state_validates_input() {
        let store = Store::new(":memory:").expect("in-memory store should always open");
        assert!(store.delete_state("blocks", 1, 0).is_err());
        assert!(store.delete_state("rewards_claimed", 10, 5).is_err());
        assert_eq!(store.delete_state("rewards_claimed", 10, 0).expect("delete"), 0);
    }

    #[test]
    fn file_backed_store_persists() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("sidecar.sqlite");
        let path = path.to_str().expect("utf-8 path");
        {
            let store = Store::new(path).expect("open");
            store.insert_block(&sample_block(42)).expect("insert");
        }
        let reopened = Store::new(path).expect("reopen");
        assert_eq!(reopened.get_latest_block().expect("latest"), Some(42));
    }
}
