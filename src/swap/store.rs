use std::path::{Path, PathBuf};
use std::str::FromStr as _;
use std::time::Duration;

use anyhow::{Context as _, Result};
use bitcoin::Address;
use rusqlite::{Connection, OptionalExtension as _, params};

use super::{PersistentSwap, SwapContract, SwapError, SwapEvent, SwapHash, SwapState};

/// Append-only swap persistence: one contract row per swap, one event row
/// per state transition. Events for a hash are totally ordered by rowid;
/// nothing is ever deleted.
#[derive(Debug)]
pub struct SwapStore {
    conn: Connection,
    path: PathBuf,
}

impl SwapStore {
    pub fn open(path: PathBuf) -> Result<Self> {
        if let Some(dir) = path.parent()
            && !dir.as_os_str().is_empty()
        {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("create swap store dir {}", dir.display()))?;
        }

        let conn =
            Connection::open(&path).with_context(|| format!("open sqlite {}", path.display()))?;
        conn.busy_timeout(Duration::from_secs(5))
            .context("set sqlite busy_timeout")?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA foreign_keys = ON;")
            .context("configure sqlite pragmas")?;

        migrate(&conn).context("migrate sqlite schema")?;

        Ok(Self { conn, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Persist a new contract. Fails with [`SwapError::DuplicateSwap`] if a
    /// swap for this hash already exists.
    pub fn create_swap(&mut self, hash: SwapHash, contract: &SwapContract) -> Result<()> {
        let hash_hex = hex::encode(hash);

        let existing: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM swap_contracts WHERE hash = ?1",
                params![&hash_hex],
                |row| row.get(0),
            )
            .optional()
            .with_context(|| format!("check swap {hash_hex}"))?;
        if existing.is_some() {
            return Err(SwapError::DuplicateSwap.into());
        }

        self.conn
            .execute(
                r#"
INSERT INTO swap_contracts (
  hash,
  preimage,
  amount_requested_sat,
  dest_addr,
  swap_invoice,
  prepay_invoice,
  cltv_expiry,
  sender_key,
  receiver_key,
  receiver_key_index,
  sweep_conf_target,
  initiation_height,
  max_miner_fee_sat,
  max_swap_fee_sat,
  max_prepay_amount_sat,
  max_prepay_routing_fee_sat,
  max_swap_routing_fee_sat,
  created_at
) VALUES (
  ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18
)
"#,
                params![
                    &hash_hex,
                    hex::encode(contract.preimage),
                    contract.amount_requested_sat,
                    contract.dest_addr.to_string(),
                    &contract.swap_invoice,
                    &contract.prepay_invoice,
                    contract.cltv_expiry,
                    hex::encode(contract.sender_key),
                    hex::encode(contract.receiver_key),
                    contract.receiver_key_index,
                    contract.sweep_conf_target,
                    contract.initiation_height,
                    contract.max_miner_fee_sat,
                    contract.max_swap_fee_sat,
                    contract.max_prepay_amount_sat,
                    contract.max_prepay_routing_fee_sat,
                    contract.max_swap_routing_fee_sat,
                    chrono::Utc::now().timestamp(),
                ],
            )
            .with_context(|| format!("insert swap {hash_hex}"))?;
        Ok(())
    }

    /// Append one state transition. Rejects appends after a terminal event:
    /// a finished swap's log is sealed.
    pub fn append_event(&mut self, hash: SwapHash, state: SwapState) -> Result<()> {
        let hash_hex = hex::encode(hash);

        let last = self
            .last_state(&hash_hex)
            .with_context(|| format!("read last state of {hash_hex}"))?;
        if let Some(last) = last
            && last.is_terminal()
        {
            anyhow::bail!("swap {hash_hex} already finished as {last:?}");
        }

        self.conn
            .execute(
                "INSERT INTO swap_events (hash, state, created_at) VALUES (?1, ?2, ?3)",
                params![
                    &hash_hex,
                    state_to_str(state),
                    chrono::Utc::now().timestamp()
                ],
            )
            .with_context(|| format!("append event for {hash_hex}"))?;
        Ok(())
    }

    /// Append the terminal event sealing the swap record.
    pub fn finalize(&mut self, hash: SwapHash, state: SwapState) -> Result<()> {
        anyhow::ensure!(state.is_terminal(), "{state:?} is not a terminal state");
        self.append_event(hash, state)
    }

    pub fn load_swap(&self, hash: SwapHash) -> Result<Option<PersistentSwap>> {
        let hash_hex = hex::encode(hash);

        let contract = self
            .conn
            .query_row(
                &format!("{CONTRACT_SELECT} WHERE hash = ?1"),
                params![&hash_hex],
                row_to_contract,
            )
            .optional()
            .with_context(|| format!("get swap {hash_hex}"))?;

        let Some(contract) = contract else {
            return Ok(None);
        };

        let events = self.events(&hash_hex)?;
        Ok(Some(PersistentSwap {
            hash,
            contract,
            events,
        }))
    }

    /// Every swap whose last event is non-terminal, with its full log.
    pub fn load_pending(&self) -> Result<Vec<PersistentSwap>> {
        Ok(self
            .list_swaps()?
            .into_iter()
            .filter(|swap| !swap.last_state().is_some_and(SwapState::is_terminal))
            .collect())
    }

    pub fn list_swaps(&self) -> Result<Vec<PersistentSwap>> {
        let mut stmt = self
            .conn
            .prepare(&format!("{CONTRACT_SELECT} ORDER BY created_at, hash"))
            .context("prepare list swaps")?;

        let rows = stmt
            .query_map([], |row| {
                let hash_hex: String = row.get(0)?;
                Ok((hash_hex, row_to_contract(row)?))
            })
            .context("query list swaps")?;

        let mut out = Vec::new();
        for row in rows {
            let (hash_hex, contract) = row.context("read swap row")?;
            let hash = hash_from_hex(&hash_hex)
                .with_context(|| format!("decode stored hash {hash_hex}"))?;
            let events = self.events(&hash_hex)?;
            out.push(PersistentSwap {
                hash,
                contract,
                events,
            });
        }
        Ok(out)
    }

    fn last_state(&self, hash_hex: &str) -> Result<Option<SwapState>> {
        let state: Option<String> = self
            .conn
            .query_row(
                "SELECT state FROM swap_events WHERE hash = ?1 ORDER BY id DESC LIMIT 1",
                params![hash_hex],
                |row| row.get(0),
            )
            .optional()
            .context("query last event")?;

        state.map(|s| state_from_str(&s)).transpose()
    }

    fn events(&self, hash_hex: &str) -> Result<Vec<SwapEvent>> {
        let mut stmt = self
            .conn
            .prepare("SELECT state, created_at FROM swap_events WHERE hash = ?1 ORDER BY id")
            .context("prepare events query")?;

        let rows = stmt
            .query_map(params![hash_hex], |row| {
                let state: String = row.get(0)?;
                let state = state_from_str(&state).map_err(|e| {
                    rusqlite::Error::FromSqlConversionFailure(
                        0,
                        rusqlite::types::Type::Text,
                        e.into(),
                    )
                })?;
                Ok(SwapEvent {
                    state,
                    created_at: row.get(1)?,
                })
            })
            .with_context(|| format!("query events for {hash_hex}"))?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row.context("read event row")?);
        }
        Ok(out)
    }
}

const CONTRACT_SELECT: &str = r#"
SELECT
  hash,
  preimage,
  amount_requested_sat,
  dest_addr,
  swap_invoice,
  prepay_invoice,
  cltv_expiry,
  sender_key,
  receiver_key,
  receiver_key_index,
  sweep_conf_target,
  initiation_height,
  max_miner_fee_sat,
  max_swap_fee_sat,
  max_prepay_amount_sat,
  max_prepay_routing_fee_sat,
  max_swap_routing_fee_sat
FROM swap_contracts
"#;

fn row_to_contract(row: &rusqlite::Row<'_>) -> rusqlite::Result<SwapContract> {
    let preimage_hex: String = row.get(1)?;
    let dest_addr: String = row.get(3)?;
    let sender_key_hex: String = row.get(7)?;
    let receiver_key_hex: String = row.get(8)?;

    // Addresses were network-checked when the contract was created.
    let dest_addr = Address::from_str(&dest_addr)
        .map_err(|e| conversion_error(3, format!("invalid dest_addr: {e}")))?
        .assume_checked();

    Ok(SwapContract {
        amount_requested_sat: column_u64(row, 2)?,
        preimage: decode_array::<32>(&preimage_hex, 1, "preimage")?,
        dest_addr,
        swap_invoice: row.get(4)?,
        prepay_invoice: row.get(5)?,
        cltv_expiry: column_u32(row, 6)?,
        sender_key: decode_array::<33>(&sender_key_hex, 7, "sender_key")?,
        receiver_key: decode_array::<33>(&receiver_key_hex, 8, "receiver_key")?,
        receiver_key_index: column_u32(row, 9)?,
        sweep_conf_target: column_u32(row, 10)?,
        initiation_height: column_u32(row, 11)?,
        max_miner_fee_sat: column_u64(row, 12)?,
        max_swap_fee_sat: column_u64(row, 13)?,
        max_prepay_amount_sat: column_u64(row, 14)?,
        max_prepay_routing_fee_sat: column_u64(row, 15)?,
        max_swap_routing_fee_sat: column_u64(row, 16)?,
    })
}

fn column_u64(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<u64> {
    let value: i64 = row.get(idx)?;
    u64::try_from(value).map_err(|_| conversion_error(idx, format!("negative value {value}")))
}

fn column_u32(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<u32> {
    let value: i64 = row.get(idx)?;
    u32::try_from(value).map_err(|_| conversion_error(idx, format!("out of range value {value}")))
}

fn decode_array<const N: usize>(
    hex_str: &str,
    idx: usize,
    what: &str,
) -> rusqlite::Result<[u8; N]> {
    let bytes = hex::decode(hex_str)
        .map_err(|e| conversion_error(idx, format!("invalid {what} hex: {e}")))?;
    bytes
        .try_into()
        .map_err(|_| conversion_error(idx, format!("{what} must be {N} bytes")))
}

fn conversion_error(idx: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, message.into())
}

fn hash_from_hex(hash_hex: &str) -> Result<SwapHash> {
    let bytes = hex::decode(hash_hex).context("decode hash hex")?;
    bytes
        .try_into()
        .map_err(|_| anyhow::anyhow!("hash must be 32 bytes"))
}

fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
CREATE TABLE IF NOT EXISTS swap_contracts (
  hash TEXT PRIMARY KEY,
  preimage TEXT NOT NULL,
  amount_requested_sat INTEGER NOT NULL,
  dest_addr TEXT NOT NULL,
  swap_invoice TEXT NOT NULL,
  prepay_invoice TEXT NOT NULL,
  cltv_expiry INTEGER NOT NULL,
  sender_key TEXT NOT NULL,
  receiver_key TEXT NOT NULL,
  receiver_key_index INTEGER NOT NULL,
  sweep_conf_target INTEGER NOT NULL,
  initiation_height INTEGER NOT NULL,
  max_miner_fee_sat INTEGER NOT NULL,
  max_swap_fee_sat INTEGER NOT NULL,
  max_prepay_amount_sat INTEGER NOT NULL,
  max_prepay_routing_fee_sat INTEGER NOT NULL,
  max_swap_routing_fee_sat INTEGER NOT NULL,
  created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS swap_events (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  hash TEXT NOT NULL REFERENCES swap_contracts(hash),
  state TEXT NOT NULL,
  created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS swap_events_hash_idx ON swap_events(hash);
"#,
    )
    .context("create tables")?;
    Ok(())
}

fn state_to_str(state: SwapState) -> &'static str {
    match state {
        SwapState::Initiated => "initiated",
        SwapState::PreimageRevealed => "preimage_revealed",
        SwapState::Success => "success",
        SwapState::FailOffchainPayments => "fail_offchain_payments",
        SwapState::FailTimeout => "fail_timeout",
    }
}

fn state_from_str(s: &str) -> Result<SwapState> {
    match s {
        "initiated" => Ok(SwapState::Initiated),
        "preimage_revealed" => Ok(SwapState::PreimageRevealed),
        "success" => Ok(SwapState::Success),
        "fail_offchain_payments" => Ok(SwapState::FailOffchainPayments),
        "fail_timeout" => Ok(SwapState::FailTimeout),
        other => anyhow::bail!("unknown swap state: {other}"),
    }
}
