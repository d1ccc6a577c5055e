//! Block reference extraction.
//!
//! Maps a JSON-RPC `(method, params)` pair to the block the call is about, so the
//! pipeline can tell block-agnostic calls, calls against the chain head and calls
//! against historical state apart.

use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;

/// The block a request refers to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockRef {
    /// `latest` or `pending`
    Latest,
    Number(u64),
}

/// Where a method carries its block reference.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BlockParam {
    /// The block tag or number is the positional parameter at this index
    Index(usize),
    /// The positional parameter at this index is a filter object; use its `fromBlock`
    FilterFromBlock(usize),
}

const DEFAULT_HISTORICAL_METHODS: &[(&str, BlockParam)] = &[
    ("eth_getBalance", BlockParam::Index(1)),
    ("eth_getCode", BlockParam::Index(1)),
    ("eth_getTransactionCount", BlockParam::Index(1)),
    ("eth_getStorageAt", BlockParam::Index(2)),
    ("eth_call", BlockParam::Index(1)),
    ("eth_estimateGas", BlockParam::Index(1)),
    ("eth_getProof", BlockParam::Index(2)),
    ("eth_getBlockByNumber", BlockParam::Index(0)),
    ("eth_getBlockTransactionCountByNumber", BlockParam::Index(0)),
    ("eth_getUncleCountByBlockNumber", BlockParam::Index(0)),
    ("eth_getTransactionByBlockNumberAndIndex", BlockParam::Index(0)),
    ("eth_getBlockReceipts", BlockParam::Index(0)),
    ("eth_feeHistory", BlockParam::Index(1)),
    ("trace_block", BlockParam::Index(0)),
    ("debug_traceBlockByNumber", BlockParam::Index(0)),
    ("debug_traceCall", BlockParam::Index(1)),
    ("eth_getLogs", BlockParam::FilterFromBlock(0)),
    ("eth_newFilter", BlockParam::FilterFromBlock(0)),
];

#[derive(Clone, Debug)]
pub struct BlockExtractor {
    historical_methods: HashMap<String, BlockParam>,
}

impl Default for BlockExtractor {
    fn default() -> Self {
        Self::new(
            DEFAULT_HISTORICAL_METHODS
                .iter()
                .map(|(method, param)| (method.to_string(), *param))
                .collect(),
        )
    }
}

impl BlockExtractor {
    pub fn new(historical_methods: HashMap<String, BlockParam>) -> Self {
        Self { historical_methods }
    }

    /// Returns the block reference of a call, or `None` when the method is not in the
    /// historical table or its block parameter is missing or unparseable.
    pub fn extract(&self, method: &str, params: &Value) -> Option<BlockRef> {
        let param = self.historical_methods.get(method)?;

        let value = match *param {
            BlockParam::Index(index) => params.get(index)?,
            BlockParam::FilterFromBlock(index) => params.get(index)?.get("fromBlock")?,
        };

        normalize(value)
    }
}

fn normalize(value: &Value) -> Option<BlockRef> {
    match value {
        Value::String(s) => match s.as_str() {
            "latest" | "pending" => Some(BlockRef::Latest),
            "earliest" => Some(BlockRef::Number(0)),
            s => parse_height(s).map(BlockRef::Number),
        },
        Value::Number(n) => n.as_u64().map(BlockRef::Number),
        // Block-number object form: `{ "blockNumber": "0x10" }`
        Value::Object(map) => map.get("blockNumber").and_then(normalize),
        _ => None,
    }
}

fn parse_height(s: &str) -> Option<u64> {
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        // A 32-byte hex string is a block hash, not a height
        if hex.is_empty() || hex.len() > 16 {
            return None;
        }
        return u64::from_str_radix(hex, 16).ok();
    }
    s.parse().ok()
}
