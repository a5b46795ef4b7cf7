//! In-memory stand-ins for the container runtime.
//!
//! [`FakeNetwork`] interprets the compose, node CLI and chain CLI command
//! lines issued by this crate and keeps a small model of wallets, peers,
//! channels, blocks and data directory files.  [`ScriptedExecutor`] replays
//! canned outputs in order.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::fmt::Write;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::config::ExecConfig;
use crate::error::Result;
use crate::executor::{CommandExecutor, CommandOutput, CommandSpec};

/// Reward credited to the mining address for each generated block
pub const BLOCK_REWARD: i64 = 50 * 100_000_000;

const UNAVAILABLE: &str = "[lncli] rpc error: code = Unavailable desc = connection error: \
    desc = \"transport: Error while dialing dial tcp: connect: connection refused\"";

/// Replays queued outputs and records every command.  Runs out to an empty
/// successful output.
#[derive(Default)]
pub struct ScriptedExecutor {
    outputs: Mutex<VecDeque<CommandOutput>>,
    calls: Mutex<Vec<CommandSpec>>,
}

impl ScriptedExecutor {
    pub fn push(&self, output: CommandOutput) {
        self.outputs.lock().unwrap().push_back(output);
    }

    pub fn calls(&self) -> Vec<CommandSpec> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl CommandExecutor for ScriptedExecutor {
    async fn run(&self, command: &CommandSpec) -> Result<CommandOutput> {
        self.calls.lock().unwrap().push(command.clone());
        Ok(self.outputs.lock().unwrap().pop_front().unwrap_or_else(|| CommandOutput::ok("")))
    }
}

/// Deterministic identity key for a node name
pub fn fake_pubkey(name: &str) -> String {
    let mut key = String::from("02");
    for b in name.bytes().chain(std::iter::repeat(0u8)).take(32) {
        let _ = write!(key, "{:02x}", b);
    }
    key
}

#[derive(Clone, Debug)]
struct FakeChannel {
    peer: String,
    point: String,
    capacity: i64,
    local: i64,
}

#[derive(Debug, Default)]
struct FakeNode {
    pubkey: String,
    rpc_port: String,
    p2p_port: String,
    data_dir: String,
    confirmed: i64,
    unconfirmed: i64,
    peers: BTreeSet<String>,
    channels: Vec<FakeChannel>,
    pending: Vec<FakeChannel>,
    files: BTreeMap<String, Vec<u8>>,
}

#[derive(Debug, Default)]
struct State {
    nodes: BTreeMap<String, FakeNode>,
    /// address to owning node
    addresses: HashMap<String, String>,
    chain_started: bool,
    network: String,
    mining_address: Option<String>,
    blocks: u64,
    mempool: Vec<(String, i64)>,
    containers: BTreeSet<String>,
    counter: u64,
    never_ready: BTreeSet<String>,
    removed_files: BTreeSet<(String, String)>,
    injected: HashMap<(String, String), VecDeque<CommandOutput>>,
    /// (node, node CLI command)
    cli_log: Vec<(String, String)>,
}

/// A simulated simnet behind the [`CommandExecutor`] seam
#[derive(Clone)]
pub struct FakeNetwork {
    exec: Arc<ExecConfig>,
    state: Arc<Mutex<State>>,
}

struct Invocation {
    subcommand: String,
    flags_env: BTreeMap<String, String>,
    name: Option<String>,
    service: Option<String>,
    rest: Vec<String>,
}

fn parse_compose(args: &[String]) -> Invocation {
    let mut it = args.iter().peekable();
    while let Some(arg) = it.peek() {
        if arg.as_str() == "-f" || arg.as_str() == "-p" {
            it.next();
            it.next();
        } else {
            break;
        }
    }
    let subcommand = it.next().cloned().unwrap_or_default();
    let mut flags_env = BTreeMap::new();
    let mut name = None;
    let mut service = None;
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "-d" | "--rm" => {}
            "-e" => {
                if let Some((k, v)) = it.next().and_then(|kv| kv.split_once('=')) {
                    flags_env.insert(k.to_string(), v.to_string());
                }
            }
            "-p" => {
                it.next();
            }
            "--name" => name = it.next().cloned(),
            _ => {
                service = Some(arg.clone());
                break;
            }
        }
    }
    Invocation { subcommand, flags_env, name, service, rest: it.cloned().collect() }
}

fn ok_json(value: Value) -> CommandOutput {
    CommandOutput::ok(value.to_string())
}

impl FakeNetwork {
    pub fn new() -> Self {
        Self::with_exec(ExecConfig::default())
    }

    pub fn with_exec(exec: ExecConfig) -> Self {
        Self { exec: Arc::new(exec), state: Arc::new(Mutex::new(State::default())) }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    /// The identity the named node reports
    pub fn pubkey(&self, name: &str) -> String {
        fake_pubkey(name)
    }

    /// The node answers nothing but connection errors
    pub fn never_ready(&self, name: &str) {
        self.state().never_ready.insert(name.to_string());
    }

    /// Answer the next `command` on `node` with `output` instead
    pub fn inject(&self, node: &str, command: &str, output: CommandOutput) {
        self.state()
            .injected
            .entry((node.to_string(), command.to_string()))
            .or_default()
            .push_back(output);
    }

    /// A data directory file that does not exist, now or after start
    pub fn remove_file(&self, node: &str, relative: &str) {
        let mut state = self.state();
        if let Some(n) = state.nodes.get_mut(node) {
            n.files.remove(relative);
        }
        state.removed_files.insert((node.to_string(), relative.to_string()));
    }

    pub fn set_balance(&self, node: &str, confirmed: i64) {
        if let Some(n) = self.state().nodes.get_mut(node) {
            n.confirmed = confirmed;
            n.unconfirmed = 0;
        }
    }

    /// Connect two started nodes directly
    pub fn add_peer(&self, a: &str, b: &str) {
        self.add_peer_locked(&mut self.state(), a, b);
    }

    pub fn mining_address(&self) -> Option<String> {
        self.state().mining_address.clone()
    }

    pub fn containers(&self) -> Vec<String> {
        self.state().containers.iter().cloned().collect()
    }

    /// Number of node CLI invocations of `command`, across all nodes
    pub fn count_cli(&self, command: &str) -> usize {
        self.state().cli_log.iter().filter(|(_, c)| c == command).count()
    }

    fn dispatch(&self, spec: &CommandSpec) -> CommandOutput {
        let mut state = self.state();
        if spec.program == self.exec.container_program {
            return self.container(&mut state, &spec.args);
        }
        if spec.program != self.exec.compose_program {
            return CommandOutput::failed(127, &format!("{}: not found", spec.program));
        }
        let inv = parse_compose(&spec.args);
        match (inv.subcommand.as_str(), inv.service.as_deref()) {
            ("up", Some(service)) if service == self.exec.chain_service => {
                if !state.chain_started {
                    state.chain_started = true;
                    state.mining_address = spec.env.get("MINING_ADDRESS").cloned();
                    state.network = match spec.env.get("NETWORK").map(String::as_str) {
                        Some("testnet") => "testnet3".to_string(),
                        Some(network) => network.to_string(),
                        None => "simnet".to_string(),
                    };
                }
                CommandOutput::ok("")
            }
            ("up", None) => CommandOutput::ok(""),
            ("run", Some(service)) if service == self.exec.node_service => {
                self.start_node(&mut state, &inv)
            }
            ("run", Some(service)) if service == self.exec.cli_service => {
                self.node_cli(&mut state, &inv)
            }
            ("run", Some(service)) if service == self.exec.chain_cli_service => {
                self.chain_cli(&mut state, &inv.rest)
            }
            ("run", Some(service)) => {
                let name = inv.name.clone().unwrap_or_else(|| service.to_string());
                if !state.containers.insert(name) {
                    let message = format!(
                        "ERROR: Cannot create container for service {}: Conflict.",
                        service
                    );
                    return CommandOutput::failed(1, &message);
                }
                CommandOutput::ok("")
            }
            _ => CommandOutput::failed(1, "unsupported compose invocation"),
        }
    }

    fn start_node(&self, state: &mut State, inv: &Invocation) -> CommandOutput {
        let name = match &inv.name {
            Some(name) => name.clone(),
            None => return CommandOutput::failed(1, "container name required"),
        };
        if state.nodes.contains_key(&name) {
            let message = format!(
                "ERROR: Cannot create container for service {}: Conflict. \
                 The container name \"/{}\" is already in use",
                self.exec.node_service, name
            );
            return CommandOutput::failed(1, &message);
        }
        let network = inv.flags_env.get("NETWORK").cloned().unwrap_or_else(|| "simnet".into());
        let mut node = FakeNode {
            pubkey: fake_pubkey(&name),
            rpc_port: inv.flags_env.get("RPCLISTEN").cloned().unwrap_or_default(),
            p2p_port: inv.flags_env.get("LISTEN").cloned().unwrap_or_default(),
            data_dir: inv.flags_env.get("LNDDIR").cloned().unwrap_or_default(),
            ..Default::default()
        };
        let mut files = vec![("tls.cert".to_string(), format!("cert of {}", name))];
        for scope in ["admin", "readonly", "invoice"] {
            files.push((
                format!("data/chain/bitcoin/{}/{}.macaroon", network, scope),
                format!("{} macaroon of {}", scope, name),
            ));
        }
        for (path, contents) in files {
            if !state.removed_files.contains(&(name.clone(), path.clone())) {
                node.files.insert(path, contents.into_bytes());
            }
        }
        state.containers.insert(name.clone());
        state.nodes.insert(name.clone(), node);
        CommandOutput::ok(format!("{}\n", name))
    }

    fn container(&self, state: &mut State, args: &[String]) -> CommandOutput {
        match args {
            [exec, name, cat, path] if exec == "exec" && cat == "cat" => {
                let node = match state.nodes.get(name) {
                    Some(node) => node,
                    None => {
                        let message = format!("Error: No such container: {}", name);
                        return CommandOutput::failed(1, &message);
                    }
                };
                let prefix = format!("{}/", node.data_dir.trim_end_matches('/'));
                let contents =
                    path.strip_prefix(prefix.as_str()).and_then(|rel| node.files.get(rel));
                match contents {
                    Some(contents) => CommandOutput::ok(contents.clone()),
                    None => {
                        let message = format!("cat: {}: No such file or directory", path);
                        CommandOutput::failed(1, &message)
                    }
                }
            }
            _ => CommandOutput::failed(1, "unsupported container invocation"),
        }
    }

    fn node_cli(&self, state: &mut State, inv: &Invocation) -> CommandOutput {
        let server = inv.flags_env.get("RPCSERVER").cloned().unwrap_or_default();
        let name = server.split(':').next().unwrap_or_default().to_string();
        let command = inv.rest.first().cloned().unwrap_or_default();
        state.cli_log.push((name.clone(), command.clone()));

        let running = state
            .nodes
            .get(&name)
            .map_or(false, |n| format!("{}:{}", name, n.rpc_port) == server);
        if !running || state.never_ready.contains(&name) {
            return CommandOutput::failed(1, UNAVAILABLE);
        }
        if let Some(output) =
            state.injected.get_mut(&(name.clone(), command.clone())).and_then(VecDeque::pop_front)
        {
            return output;
        }

        let args = &inv.rest[1..];
        match command.as_str() {
            "getinfo" => {
                let blocks = state.blocks;
                let node = &state.nodes[&name];
                ok_json(json!({
                    "version": "0.17.4-beta commit=v0.17.4-beta",
                    "identity_pubkey": node.pubkey,
                    "alias": name,
                    "num_peers": node.peers.len(),
                    "block_height": blocks,
                    "synced_to_chain": true,
                }))
            }
            "newaddress" => {
                state.counter += 1;
                let address = format!("rp{}{}", name, state.counter);
                state.addresses.insert(address.clone(), name);
                ok_json(json!({ "address": address }))
            }
            "walletbalance" => {
                let node = &state.nodes[&name];
                ok_json(json!({
                    "total_balance": (node.confirmed + node.unconfirmed).to_string(),
                    "confirmed_balance": node.confirmed.to_string(),
                    "unconfirmed_balance": node.unconfirmed.to_string(),
                }))
            }
            "channelbalance" => {
                let node = &state.nodes[&name];
                let balance: i64 = node.channels.iter().map(|c| c.local).sum();
                let pending: i64 = node.pending.iter().map(|c| c.local).sum();
                ok_json(json!({
                    "balance": balance.to_string(),
                    "pending_open_balance": pending.to_string(),
                }))
            }
            "listpeers" => {
                let peers: Vec<Value> = state.nodes[&name]
                    .peers
                    .iter()
                    .map(|p| {
                        let peer = &state.nodes[p];
                        json!({
                            "pub_key": peer.pubkey,
                            "address": format!("{}:{}", p, peer.p2p_port),
                            "inbound": false,
                        })
                    })
                    .collect();
                ok_json(json!({ "peers": peers }))
            }
            "listchannels" => {
                let channels: Vec<Value> = state.nodes[&name]
                    .channels
                    .iter()
                    .map(|c| {
                        json!({
                            "remote_pubkey": fake_pubkey(&c.peer),
                            "channel_point": c.point,
                            "capacity": c.capacity.to_string(),
                            "local_balance": c.local.to_string(),
                            "remote_balance": (c.capacity - c.local).to_string(),
                            "active": true,
                        })
                    })
                    .collect();
                ok_json(json!({ "channels": channels }))
            }
            "pendingchannels" => {
                let pending: Vec<Value> = state.nodes[&name]
                    .pending
                    .iter()
                    .map(|c| {
                        json!({
                            "channel": {
                                "remote_node_pub": fake_pubkey(&c.peer),
                                "channel_point": c.point,
                                "capacity": c.capacity.to_string(),
                            },
                            "commit_fee": "9050",
                        })
                    })
                    .collect();
                ok_json(json!({ "total_limbo_balance": "0", "pending_open_channels": pending }))
            }
            "connect" => self.connect(state, &name, args),
            "openchannel" => self.open_channel(state, &name, args),
            "sendcoins" => self.send_coins(state, &name, args),
            _ => CommandOutput::failed(1, &format!("No help topic for '{}'", command)),
        }
    }

    fn node_by_pubkey(state: &State, key: &str) -> Option<String> {
        state.nodes.iter().find(|(_, n)| n.pubkey == key).map(|(name, _)| name.clone())
    }

    fn connect(&self, state: &mut State, name: &str, args: &[String]) -> CommandOutput {
        let key = match args.first().and_then(|a| a.split_once('@')) {
            Some((key, _)) => key.to_string(),
            None => {
                let message = "[lncli] target address expected in format: pubkey@host:port";
                return CommandOutput::failed(1, message);
            }
        };
        let peer = match Self::node_by_pubkey(state, &key) {
            Some(peer) if peer != name => peer,
            _ => {
                let message =
                    "[lncli] rpc error: code = Unknown desc = dial tcp: connection refused";
                return CommandOutput::failed(1, message);
            }
        };
        if state.nodes[name].peers.contains(&peer) {
            let message = format!(
                "[lncli] rpc error: code = Unknown desc = already connected to peer: {}",
                key
            );
            return CommandOutput::failed(1, &message);
        }
        self.add_peer_locked(state, name, &peer);
        ok_json(json!({}))
    }

    fn add_peer_locked(&self, state: &mut State, a: &str, b: &str) {
        if let Some(n) = state.nodes.get_mut(a) {
            n.peers.insert(b.to_string());
        }
        if let Some(n) = state.nodes.get_mut(b) {
            n.peers.insert(a.to_string());
        }
    }

    fn open_channel(&self, state: &mut State, name: &str, args: &[String]) -> CommandOutput {
        let (key, local, push) = match args {
            [key, local, push] => match (local.parse::<i64>(), push.parse::<i64>()) {
                (Ok(local), Ok(push)) => (key.clone(), local, push),
                _ => return CommandOutput::failed(1, "[lncli] unable to decode amounts"),
            },
            _ => {
                return CommandOutput::failed(1, "[lncli] node_key, local_amt and push_amt expected")
            }
        };
        let peer = match Self::node_by_pubkey(state, &key) {
            Some(peer) if state.nodes[name].peers.contains(&peer) => peer,
            _ => {
                let message = "[lncli] rpc error: code = Unknown desc = peer is not online";
                return CommandOutput::failed(1, message);
            }
        };
        if state.nodes[name].confirmed < local {
            let message = "[lncli] rpc error: code = Unknown desc = \
                not enough witness outputs to create funding transaction";
            return CommandOutput::failed(1, message);
        }
        state.counter += 1;
        let txid = format!("{:064x}", state.counter);
        let point = format!("{}:0", txid);
        if let Some(source) = state.nodes.get_mut(name) {
            source.confirmed -= local;
            source.pending.push(FakeChannel {
                peer: peer.clone(),
                point: point.clone(),
                capacity: local,
                local: local - push,
            });
        }
        if let Some(target) = state.nodes.get_mut(&peer) {
            target.pending.push(FakeChannel {
                peer: name.to_string(),
                point,
                capacity: local,
                local: push,
            });
        }
        ok_json(json!({ "funding_txid": txid, "output_index": 0 }))
    }

    fn send_coins(&self, state: &mut State, name: &str, args: &[String]) -> CommandOutput {
        let flag =
            |prefix: &str| args.iter().find_map(|a| a.strip_prefix(prefix)).map(str::to_string);
        let amount = flag("--amt=").and_then(|a| a.parse::<i64>().ok());
        let (address, amount) = match (flag("--addr="), amount) {
            (Some(address), Some(amount)) => (address, amount),
            _ => return CommandOutput::failed(1, "[lncli] Address and amount expected"),
        };
        if state.nodes[name].confirmed < amount {
            let message = "[lncli] rpc error: code = Unknown desc = insufficient funds available";
            return CommandOutput::failed(1, message);
        }
        if let Some(source) = state.nodes.get_mut(name) {
            source.confirmed -= amount;
        }
        if let Some(owner) = state.addresses.get(&address).cloned() {
            if let Some(target) = state.nodes.get_mut(&owner) {
                target.unconfirmed += amount;
            }
        }
        state.mempool.push((address, amount));
        state.counter += 1;
        ok_json(json!({ "txid": format!("{:064x}", state.counter) }))
    }

    fn chain_cli(&self, state: &mut State, args: &[String]) -> CommandOutput {
        if !state.chain_started {
            let message = "Post \"https://localhost:18556\": dial tcp: connect: connection refused";
            return CommandOutput::failed(1, message);
        }
        match args {
            [cmd] if cmd == "getblockchaininfo" => ok_json(json!({
                "chain": state.network,
                "blocks": state.blocks,
                "bestblockhash": format!("{:064x}", state.blocks),
            })),
            [cmd, n] if cmd == "generate" => match n.parse::<u64>() {
                Ok(n) => {
                    let hashes: Vec<String> =
                        (1..=n).map(|i| format!("{:064x}", state.blocks + i)).collect();
                    self.mine(state, n);
                    CommandOutput::ok(serde_json::to_string(&hashes).unwrap_or_default())
                }
                Err(_) => CommandOutput::failed(1, "invalid block count"),
            },
            _ => CommandOutput::failed(1, "unknown command"),
        }
    }

    fn mine(&self, state: &mut State, blocks: u64) {
        state.blocks += blocks;
        let miner =
            state.mining_address.as_ref().and_then(|a| state.addresses.get(a)).cloned();
        if let Some(node) = miner.and_then(|m| state.nodes.get_mut(&m)) {
            node.confirmed += BLOCK_REWARD * blocks as i64;
        }
        for (address, amount) in std::mem::take(&mut state.mempool) {
            let owner = state.addresses.get(&address).cloned();
            if let Some(node) = owner.and_then(|o| state.nodes.get_mut(&o)) {
                node.unconfirmed -= amount;
                node.confirmed += amount;
            }
        }
        for node in state.nodes.values_mut() {
            let pending = std::mem::take(&mut node.pending);
            node.channels.extend(pending);
        }
    }
}

impl Default for FakeNetwork {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CommandExecutor for FakeNetwork {
    async fn run(&self, command: &CommandSpec) -> Result<CommandOutput> {
        Ok(self.dispatch(command))
    }
}
