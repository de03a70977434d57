//! Turns a [`Configuration`] into the client's command-line vocabulary.
//!
//! Token order is fixed and the client depends on it: account, proxy, break
//! settings, memory, data collection, debug, allow list, standalone switches,
//! and finally the world.

use std::{net::TcpListener, sync::Arc};

use rand::seq::SliceRandom;

use crate::{Configuration, Parameter, World};

pub const BREAK_SETTINGS_FLAG: &str = "-breaksettings";
pub const MEMORY_FLAG: &str = "-mem";
pub const DATA_FLAG: &str = "-data";
pub const DEBUG_FLAG: &str = "-debug";
pub const ALLOW_FLAG: &str = "-allow";
pub const DISMISS_RANDOMS_FLAG: &str = "-dismissrandoms";
pub const NEW_MOUSE_FLAG: &str = "-newmouse";
pub const MIRROR_FLAG: &str = "-mirror";
pub const LAUNCH_GAME_FLAG: &str = "-launchgame";

/// Encodes the configuration with a world drawn at random from its pool.
///
/// Every call draws again.
pub fn encode(config: &Configuration) -> anyhow::Result<Vec<String>> {
    let world = pick_world(&config.worlds)?;
    Ok(encode_with_world(config, &world))
}

/// Encodes the configuration against an already chosen world.
pub fn encode_with_world(config: &Configuration, world: &World) -> Vec<String> {
    let mut tokens = encode_flags(config, probe_free_port);
    tokens.extend(world.to_parameter());
    tokens
}

pub fn pick_world(worlds: &[Arc<World>]) -> anyhow::Result<Arc<World>> {
    worlds
        .choose(&mut rand::thread_rng())
        .cloned()
        .ok_or_else(|| anyhow::anyhow!("world pool is empty; select at least one world"))
}

fn encode_flags(config: &Configuration, probe: impl FnOnce() -> Option<u16>) -> Vec<String> {
    let mut tokens = config.account.to_parameter();

    if let Some(proxy) = &config.proxy {
        tokens.extend(proxy.to_parameter());
    }

    if config.enable_breaks {
        tokens.push(BREAK_SETTINGS_FLAG.to_string());
        tokens.push(format!("{}:{}", config.enable_breaks, config.stop_after_break));
    }

    if let Some(mem) = config.memory_allocation {
        tokens.push(MEMORY_FLAG.to_string());
        tokens.push(mem.to_string());
    }

    if config.collect_data {
        tokens.push(DATA_FLAG.to_string());
        tokens.push("1".to_string());
    }

    if let Some(port) = resolve_debug_port(config, probe) {
        tokens.push(DEBUG_FLAG.to_string());
        tokens.push(port.to_string());
    }

    if let Some(allow) = allow_list(config) {
        tokens.push(ALLOW_FLAG.to_string());
        tokens.push(allow);
    }

    for (set, flag) in [
        (config.dismiss_randoms, DISMISS_RANDOMS_FLAG),
        (config.new_mouse, NEW_MOUSE_FLAG),
        (config.mirror_mode, MIRROR_FLAG),
        (config.launch_game, LAUNCH_GAME_FLAG),
    ] {
        if set {
            tokens.push(flag.to_string());
        }
    }

    tokens
}

fn resolve_debug_port(config: &Configuration, probe: impl FnOnce() -> Option<u16>) -> Option<u16> {
    if !config.debug_mode {
        return None;
    }
    match config.debug_port {
        Some(port) => Some(port),
        None => probe().filter(|p| *p != 0),
    }
}

/// Comma-joined allow list in the client's priority order, `None` when empty.
pub fn allow_list(config: &Configuration) -> Option<String> {
    let entries: Vec<&str> = [
        (config.low_resource_mode, "lowresource"),
        (config.low_cpu_mode, "lowcpu"),
        (config.reflection, "reflection"),
        (config.no_randoms, "norandoms"),
        (config.no_interface, "nointerface"),
        (config.no_render, "norender"),
    ]
    .into_iter()
    .filter_map(|(set, name)| set.then_some(name))
    .collect();

    if entries.is_empty() {
        None
    } else {
        Some(entries.join(","))
    }
}

/// Asks the OS for a currently free TCP port.
///
/// The listener is dropped before returning, so the port is only a hint: the
/// client binds it later and may lose a race with another process.
pub fn probe_free_port() -> Option<u16> {
    let listener = match TcpListener::bind(("0.0.0.0", 0)) {
        Ok(l) => l,
        Err(e) => {
            tracing::debug!(error = %e, "free port probe failed");
            return None;
        }
    };
    listener.local_addr().ok().map(|a| a.port())
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;
    use crate::{Account, Proxy, Script};

    fn config() -> Configuration {
        let mut c = Configuration::new(
            Arc::new(Account::new("alice", "pw")),
            vec![Arc::new(Script::new("Miner", "iron", false))],
            Path::new("/tmp/botrun-test-logs"),
        );
        c.worlds = vec![Arc::new(World::new(301, false))];
        c
    }

    fn pos(tokens: &[String], flag: &str) -> Option<usize> {
        tokens.iter().position(|t| t == flag)
    }

    #[test]
    fn account_tokens_come_first() {
        let mut c = config();
        c.proxy = Some(Proxy::basic("1.1.1.1", 80));
        c.enable_breaks = true;
        c.collect_data = true;
        c.no_render = true;
        let tokens = encode(&c).unwrap();
        assert_eq!(&tokens[..2], &["-bot", "alice:pw"]);
        assert_eq!(&tokens[2..4], &["-proxy", "1.1.1.1:80"]);
        assert_eq!(&tokens[tokens.len() - 2..], &["-world", "301"]);
    }

    #[test]
    fn minimal_config_has_account_and_world_only() {
        let tokens = encode_with_world(&config(), &World::new(302, true));
        assert_eq!(tokens, vec!["-bot", "alice:pw", "-world", "302"]);
    }

    #[test]
    fn memory_token_only_when_set() {
        let mut c = config();
        assert_eq!(pos(&encode(&c).unwrap(), MEMORY_FLAG), None);
        c.memory_allocation = Some(4096);
        let tokens = encode(&c).unwrap();
        let i = pos(&tokens, MEMORY_FLAG).unwrap();
        assert_eq!(tokens[i + 1], "4096");
    }

    #[test]
    fn break_settings_need_enable_breaks() {
        let mut c = config();
        c.stop_after_break = true;
        assert_eq!(pos(&encode(&c).unwrap(), BREAK_SETTINGS_FLAG), None);
        c.enable_breaks = true;
        let tokens = encode(&c).unwrap();
        let i = pos(&tokens, BREAK_SETTINGS_FLAG).unwrap();
        assert_eq!(tokens[i + 1], "true:true");
    }

    #[test]
    fn explicit_debug_port_is_used_verbatim() {
        let mut c = config();
        c.debug_mode = true;
        c.debug_port = Some(9222);
        let tokens = encode_flags(&c, || panic!("must not probe"));
        let i = pos(&tokens, DEBUG_FLAG).unwrap();
        assert_eq!(tokens[i + 1], "9222");
        assert_eq!(tokens.iter().filter(|t| *t == DEBUG_FLAG).count(), 1);
    }

    #[test]
    fn debug_port_probed_when_unset() {
        let mut c = config();
        c.debug_mode = true;
        let tokens = encode_flags(&c, || Some(50123));
        let i = pos(&tokens, DEBUG_FLAG).unwrap();
        assert_eq!(tokens[i + 1], "50123");

        let tokens = encode_flags(&c, || None);
        assert_eq!(pos(&tokens, DEBUG_FLAG), None);
    }

    #[test]
    fn real_probe_yields_positive_port_or_nothing() {
        let mut c = config();
        c.debug_mode = true;
        let tokens = encode(&c).unwrap();
        if let Some(i) = pos(&tokens, DEBUG_FLAG) {
            let port: u32 = tokens[i + 1].parse().unwrap();
            assert!(port > 0 && port <= u16::MAX as u32);
        }
    }

    #[test]
    fn no_debug_token_without_debug_mode() {
        let mut c = config();
        c.debug_port = Some(9222);
        let tokens = encode_flags(&c, || panic!("must not probe"));
        assert_eq!(pos(&tokens, DEBUG_FLAG), None);
    }

    #[test]
    fn allow_list_follows_priority_order() {
        let mut c = config();
        assert_eq!(allow_list(&c), None);
        assert_eq!(pos(&encode(&c).unwrap(), ALLOW_FLAG), None);

        c.no_render = true;
        c.low_cpu_mode = true;
        let tokens = encode(&c).unwrap();
        let i = pos(&tokens, ALLOW_FLAG).unwrap();
        assert_eq!(tokens[i + 1], "lowcpu,norender");

        c.low_resource_mode = true;
        c.reflection = true;
        c.no_randoms = true;
        c.no_interface = true;
        assert_eq!(
            allow_list(&c).as_deref(),
            Some("lowresource,lowcpu,reflection,norandoms,nointerface,norender")
        );
    }

    #[test]
    fn standalone_switches_in_order() {
        let mut c = config();
        c.launch_game = true;
        c.dismiss_randoms = true;
        c.mirror_mode = true;
        c.new_mouse = true;
        let tokens = encode_with_world(&c, &World::new(301, false));
        assert_eq!(
            &tokens[2..6],
            &[DISMISS_RANDOMS_FLAG, NEW_MOUSE_FLAG, MIRROR_FLAG, LAUNCH_GAME_FLAG]
        );
    }

    #[test]
    fn empty_world_pool_is_an_error() {
        let mut c = config();
        c.worlds.clear();
        let err = encode(&c).unwrap_err();
        assert!(err.to_string().contains("world pool is empty"));
    }

    #[test]
    fn world_drawn_from_pool() {
        let mut c = config();
        c.worlds = vec![
            Arc::new(World::new(301, false)),
            Arc::new(World::new(302, false)),
        ];
        for _ in 0..20 {
            let tokens = encode(&c).unwrap();
            let world = tokens.last().unwrap();
            assert!(world == "301" || world == "302");
        }
    }
}
