//! Key layout for chain records.
//!
//! Each record kind lives under its own ASCII prefix. The account index
//! stores `u32::MAX - create_time` big-endian so a forward scan yields the
//! newest transactions first.

use super::engine::KvStore;
use crate::core::{ClusterError, Result};

pub const TX: &[u8] = b"tx_";
pub const TX_BLOCK_HEADER: &[u8] = b"txBlockHeader_";
pub const TX_ROOT_BLOCK_HEADER: &[u8] = b"txRootBlockHeader_";
pub const SPENT: &[u8] = b"spent_";
pub const ACCOUNT_TX: &[u8] = b"addr_";
pub const MINOR_BLOCK: &[u8] = b"mblock_";
pub const MINOR_BLOCK_COINBASE_TX: &[u8] = b"mblockCoinbaseTx_";
pub const MINOR_BLOCK_TX_COUNT: &[u8] = b"mblockTxCount_";
pub const ROOT_BLOCK: &[u8] = b"rblock_";
pub const ROOT_BLOCK_HEADER: &[u8] = b"rblockHeader_";
/// Process identity written by the binaries at start.
pub const NODE_META: &[u8] = b"node_meta";

pub const MAX_TIMESTAMP: u32 = u32::MAX;

fn join(prefix: &[u8], parts: &[&[u8]]) -> Vec<u8> {
    let len = prefix.len() + parts.iter().map(|p| p.len()).sum::<usize>();
    let mut key = Vec::with_capacity(len);
    key.extend_from_slice(prefix);
    for part in parts {
        key.extend_from_slice(part);
    }
    key
}

pub fn tx(tx_hash: &[u8]) -> Vec<u8> {
    join(TX, &[tx_hash])
}

pub fn tx_block_header(tx_hash: &[u8]) -> Vec<u8> {
    join(TX_BLOCK_HEADER, &[tx_hash])
}

pub fn tx_root_block_header(tx_hash: &[u8]) -> Vec<u8> {
    join(TX_ROOT_BLOCK_HEADER, &[tx_hash])
}

/// Key of the transaction that spent the serialized input `tx_input`.
pub fn spent(tx_input: &[u8]) -> Vec<u8> {
    join(SPENT, &[tx_input])
}

pub fn minor_block(block_hash: &[u8]) -> Vec<u8> {
    join(MINOR_BLOCK, &[block_hash])
}

pub fn minor_block_coinbase_tx(block_hash: &[u8]) -> Vec<u8> {
    join(MINOR_BLOCK_COINBASE_TX, &[block_hash])
}

pub fn minor_block_tx_count(block_hash: &[u8]) -> Vec<u8> {
    join(MINOR_BLOCK_TX_COUNT, &[block_hash])
}

pub fn root_block(block_hash: &[u8]) -> Vec<u8> {
    join(ROOT_BLOCK, &[block_hash])
}

pub fn root_block_header(block_hash: &[u8]) -> Vec<u8> {
    join(ROOT_BLOCK_HEADER, &[block_hash])
}

// ============================================================================
// Account transaction index
// ============================================================================

pub fn account_tx(address: &[u8], create_time: u32, tx_hash: &[u8]) -> Vec<u8> {
    let inverse = (MAX_TIMESTAMP - create_time).to_be_bytes();
    join(ACCOUNT_TX, &[address, &inverse, tx_hash])
}

/// Smallest key strictly greater than every key starting with `prefix`,
/// or `None` if no such key exists (prefix is all `0xff`).
pub fn prefix_end(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.pop() {
        if last < u8::MAX {
            end.push(last + 1);
            return Some(end);
        }
    }
    None
}

/// One entry of an account's transaction history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountTx {
    pub tx_hash: Vec<u8>,
    pub create_time: u32,
}

/// Records `tx_hash` in the history of `address`.
pub fn put_account_tx<S: KvStore + ?Sized>(
    store: &mut S,
    address: &[u8],
    create_time: u32,
    tx_hash: &[u8],
) -> Result<()> {
    store.put(
        &account_tx(address, create_time, tx_hash),
        &create_time.to_be_bytes(),
    )
}

/// Transactions of `address`, newest first. `limit == 0` means no limit.
pub fn account_txs<S: KvStore + ?Sized>(
    store: &S,
    address: &[u8],
    limit: usize,
) -> Result<Vec<AccountTx>> {
    let start = join(ACCOUNT_TX, &[address]);
    let entries = match prefix_end(&start) {
        Some(end) => store.range_scan(&start, &end)?,
        None => Vec::new(),
    };

    let hash_offset = start.len() + 4;
    let mut txs = Vec::new();
    for (key, value) in entries {
        if key.len() < hash_offset || value.len() != 4 {
            return Err(ClusterError::Storage(format!(
                "malformed account index entry of {} bytes",
                key.len()
            )));
        }
        txs.push(AccountTx {
            tx_hash: key[hash_offset..].to_vec(),
            create_time: u32::from_be_bytes([value[0], value[1], value[2], value[3]]),
        });
        if limit > 0 && txs.len() >= limit {
            break;
        }
    }
    Ok(txs)
}

/// Stores a transaction body prefixed with its block's create time.
pub fn put_tx<S: KvStore + ?Sized>(
    store: &mut S,
    tx_hash: &[u8],
    create_time: u32,
    tx_bytes: &[u8],
) -> Result<()> {
    let mut value = Vec::with_capacity(4 + tx_bytes.len());
    value.extend_from_slice(&create_time.to_be_bytes());
    value.extend_from_slice(tx_bytes);
    store.put(&tx(tx_hash), &value)
}

/// Returns the transaction body and its create time.
pub fn get_tx<S: KvStore + ?Sized>(store: &S, tx_hash: &[u8]) -> Result<Option<(Vec<u8>, u32)>> {
    let Some(value) = store.get(&tx(tx_hash))? else {
        return Ok(None);
    };
    if value.len() < 4 {
        return Err(ClusterError::Storage("truncated transaction record".to_string()));
    }
    let create_time = u32::from_be_bytes([value[0], value[1], value[2], value[3]]);
    Ok(Some((value[4..].to_vec(), create_time)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryKv;

    #[test]
    fn test_prefix_end() {
        assert_eq!(prefix_end(b"ab"), Some(b"ac".to_vec()));
        assert_eq!(prefix_end(&[1, 0xff]), Some(vec![2]));
        assert_eq!(prefix_end(&[0xff, 0xff]), None);
    }

    #[test]
    fn test_account_history_newest_first() {
        let mut kv = InMemoryKv::new();
        let alice = [0xaa; 20];
        let bob = [0xab; 20];
        put_account_tx(&mut kv, &alice, 100, b"h100").unwrap();
        put_account_tx(&mut kv, &alice, 300, b"h300").unwrap();
        put_account_tx(&mut kv, &alice, 200, b"h200").unwrap();
        put_account_tx(&mut kv, &bob, 999, b"hbob").unwrap();

        let history = account_txs(&kv, &alice, 0).unwrap();
        let times: Vec<u32> = history.iter().map(|t| t.create_time).collect();
        assert_eq!(times, vec![300, 200, 100]);
        assert_eq!(history[0].tx_hash, b"h300".to_vec());

        let limited = account_txs(&kv, &alice, 2).unwrap();
        assert_eq!(limited.len(), 2);
    }

    #[test]
    fn test_tx_record() {
        let mut kv = InMemoryKv::new();
        put_tx(&mut kv, b"hash", 42, b"body").unwrap();
        assert_eq!(get_tx(&kv, b"hash").unwrap(), Some((b"body".to_vec(), 42)));
        assert_eq!(get_tx(&kv, b"other").unwrap(), None);
        assert!(kv.contains(b"tx_hash").unwrap());
    }

    #[test]
    fn test_prefixes_are_distinct() {
        assert_ne!(minor_block(b"h"), root_block(b"h"));
        assert!(minor_block_tx_count(b"h").starts_with(b"mblockTxCount_"));
        assert_eq!(tx_root_block_header(b"h"), b"txRootBlockHeader_h".to_vec());
    }
}
