//! Responses of the node and chain command line tools.
//!
//! The node CLI prints 64-bit integers as JSON strings, so amounts accept
//! either form.

use serde::{Deserialize, Deserializer, Serialize};

fn amount<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Amount {
        Number(i64),
        Text(String),
    }

    match Amount::deserialize(deserializer)? {
        Amount::Number(n) => Ok(n),
        Amount::Text(s) if s.is_empty() => Ok(0),
        Amount::Text(s) => s.parse().map_err(serde::de::Error::custom),
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GetInfo {
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub identity_pubkey: String,
    #[serde(default)]
    pub alias: String,
    #[serde(default)]
    pub num_peers: u32,
    #[serde(default)]
    pub block_height: u32,
    #[serde(default)]
    pub synced_to_chain: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct NewAddress {
    #[serde(default)]
    pub address: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct WalletBalance {
    #[serde(default, deserialize_with = "amount")]
    pub total_balance: i64,
    #[serde(default, deserialize_with = "amount")]
    pub confirmed_balance: i64,
    #[serde(default, deserialize_with = "amount")]
    pub unconfirmed_balance: i64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ChannelBalance {
    #[serde(default, deserialize_with = "amount")]
    pub balance: i64,
    #[serde(default, deserialize_with = "amount")]
    pub pending_open_balance: i64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Peer {
    pub pub_key: String,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub inbound: bool,
}

/// `peers` is required: its absence means the node did not really answer
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ListPeers {
    pub peers: Vec<Peer>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Channel {
    pub remote_pubkey: String,
    #[serde(default)]
    pub channel_point: String,
    #[serde(default, deserialize_with = "amount")]
    pub capacity: i64,
    #[serde(default, deserialize_with = "amount")]
    pub local_balance: i64,
    #[serde(default, deserialize_with = "amount")]
    pub remote_balance: i64,
    #[serde(default)]
    pub active: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ListChannels {
    pub channels: Vec<Channel>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PendingChannel {
    pub remote_node_pub: String,
    #[serde(default)]
    pub channel_point: String,
    #[serde(default, deserialize_with = "amount")]
    pub capacity: i64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PendingOpenChannel {
    pub channel: PendingChannel,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PendingChannels {
    #[serde(default)]
    pub pending_open_channels: Vec<PendingOpenChannel>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct OpenChannel {
    #[serde(default)]
    pub funding_txid: String,
    #[serde(default)]
    pub output_index: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SendCoins {
    #[serde(default)]
    pub txid: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BlockchainInfo {
    #[serde(default)]
    pub chain: String,
    #[serde(default)]
    pub blocks: u64,
    #[serde(default)]
    pub bestblockhash: String,
}
