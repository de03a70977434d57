//! Binary store for run configurations.
//!
//! A store is `MAGIC`, a `u16` store version, a `u32` record count and that many
//! configuration records. Integers are big-endian. Every record and nested value
//! is written as `tag, u32 body length, body`, so a record written by an older
//! build simply ends early and the fields it lacks decode to their defaults.
//!
//! Configuration fields are read strictly in the order they were historically
//! written. Fields added after the first release are read through
//! [`RecordReader::soft`], each on its own, so a missing one never blocks the next.

use std::{path::Path, sync::Arc};

use anyhow::Context;

use crate::{
    Account, Configuration, Proxy, Script, World, WorldCatalog,
    configuration::{RunState, new_log_file},
};

const MAGIC: &[u8; 4] = b"BRCF";
const STORE_VERSION: u16 = 1;

mod tag {
    pub const NULL: u8 = 0x70;
    pub const STRING: u8 = 0x74;
    pub const LIST: u8 = 0x4c;
    pub const ACCOUNT: u8 = 0x41;
    pub const CONFIGURATION: u8 = 0x43;
    pub const PROXY: u8 = 0x50;
    pub const SECURED_PROXY: u8 = 0x51;
    pub const SCRIPT: u8 = 0x53;
    pub const WORLD: u8 = 0x57;
    // Records from before world pools hold a world type here, followed by a
    // world number and a randomize flag.
    pub const LEGACY_WORLD_TYPE: u8 = 0x54;
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("not a configuration store")]
    BadMagic,
    #[error("unsupported store version {0}")]
    UnsupportedVersion(u16),
    #[error("unexpected end of data reading {0}")]
    Truncated(&'static str),
    #[error("unexpected tag 0x{found:02x} reading {field}")]
    UnexpectedTag { field: &'static str, found: u8 },
    #[error("{0} is missing")]
    Missing(&'static str),
    #[error("invalid utf-8 in {0}")]
    InvalidUtf8(&'static str),
    #[error("{field} out of range: {value}")]
    OutOfRange { field: &'static str, value: i64 },
}

#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("{field} out of range: {value} (at most {max})")]
    OutOfRange {
        field: &'static str,
        value: u32,
        max: u32,
    },
}

/// Collaborators needed to rebuild a configuration from storage.
pub struct DecodeContext<'a> {
    pub catalog: &'a dyn WorldCatalog,
    /// Where regenerated log files go.
    pub logs_dir: &'a Path,
}

#[derive(Default)]
struct RecordWriter {
    buf: Vec<u8>,
}

impl RecordWriter {
    fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    fn write_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    fn write_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    fn write_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    fn write_i32(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    fn write_bool(&mut self, v: bool) {
        self.write_u8(u8::from(v));
    }

    fn write_str(&mut self, s: &str) {
        self.write_u32(s.len() as u32);
        self.buf.extend_from_slice(s.as_bytes());
    }

    fn write_string(&mut self, s: &str) {
        self.write_u8(tag::STRING);
        self.write_str(s);
    }

    fn write_null(&mut self) {
        self.write_u8(tag::NULL);
    }

    fn write_object(&mut self, kind: u8, body: impl FnOnce(&mut RecordWriter)) {
        let mut inner = RecordWriter::default();
        body(&mut inner);
        self.write_u8(kind);
        self.write_u32(inner.buf.len() as u32);
        self.buf.extend_from_slice(&inner.buf);
    }

    fn write_list<T>(&mut self, items: &[T], mut each: impl FnMut(&mut RecordWriter, &T)) {
        self.write_object(tag::LIST, |w| {
            w.write_u32(items.len() as u32);
            for item in items {
                each(w, item);
            }
        });
    }
}

struct RecordReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> RecordReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, n: usize, field: &'static str) -> Result<&'a [u8], DecodeError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.data.len())
            .ok_or(DecodeError::Truncated(field))?;
        let out = &self.data[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn take_array<const N: usize>(&mut self, field: &'static str) -> Result<[u8; N], DecodeError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N, field)?);
        Ok(out)
    }

    fn read_u8(&mut self, field: &'static str) -> Result<u8, DecodeError> {
        Ok(self.take_array::<1>(field)?[0])
    }

    fn read_u16(&mut self, field: &'static str) -> Result<u16, DecodeError> {
        Ok(u16::from_be_bytes(self.take_array(field)?))
    }

    fn read_u32(&mut self, field: &'static str) -> Result<u32, DecodeError> {
        Ok(u32::from_be_bytes(self.take_array(field)?))
    }

    fn read_i32(&mut self, field: &'static str) -> Result<i32, DecodeError> {
        Ok(i32::from_be_bytes(self.take_array(field)?))
    }

    fn read_bool(&mut self, field: &'static str) -> Result<bool, DecodeError> {
        Ok(self.read_u8(field)? != 0)
    }

    fn read_str(&mut self, field: &'static str) -> Result<String, DecodeError> {
        let len = self.read_u32(field)? as usize;
        let bytes = self.take(len, field)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| DecodeError::InvalidUtf8(field))
    }

    /// A null string slot reads as empty.
    fn read_string(&mut self, field: &'static str) -> Result<String, DecodeError> {
        match self.read_u8(field)? {
            tag::STRING => self.read_str(field),
            tag::NULL => Ok(String::new()),
            found => Err(DecodeError::UnexpectedTag { field, found }),
        }
    }

    /// Reads a tagged object, returning its tag and a reader over its body.
    /// `None` means the slot held null.
    fn read_object(
        &mut self,
        field: &'static str,
    ) -> Result<Option<(u8, RecordReader<'a>)>, DecodeError> {
        let kind = self.read_u8(field)?;
        if kind == tag::NULL {
            return Ok(None);
        }
        let len = self.read_u32(field)? as usize;
        let body = self.take(len, field)?;
        Ok(Some((kind, RecordReader::new(body))))
    }

    /// Runs `read`, rewinding and returning `None` if it fails.
    fn soft<T>(
        &mut self,
        field: &'static str,
        read: impl FnOnce(&mut Self) -> Result<T, DecodeError>,
    ) -> Option<T> {
        let start = self.pos;
        match read(self) {
            Ok(v) => Some(v),
            Err(e) => {
                self.pos = start;
                tracing::debug!(field, error = %e, "stored configuration lacks field, using default");
                None
            }
        }
    }

    fn soft_bool(&mut self, field: &'static str) -> bool {
        self.soft(field, |r| r.read_bool(field)).unwrap_or(false)
    }

    fn soft_string(&mut self, field: &'static str) -> String {
        self.soft(field, |r| r.read_string(field)).unwrap_or_default()
    }
}

fn write_account(w: &mut RecordWriter, account: &Account) {
    w.write_object(tag::ACCOUNT, |w| {
        w.write_string(&account.username);
        w.write_string(&account.password);
        w.write_i32(account.pin.map_or(-1, i32::from));
    });
}

fn read_account(r: &mut RecordReader<'_>) -> Result<Account, DecodeError> {
    match r.read_object("account")? {
        Some((tag::ACCOUNT, mut body)) => {
            let username = body.read_string("account.username")?;
            let password = body.read_string("account.password")?;
            let pin = body
                .soft("account.pin", |b| b.read_i32("account.pin"))
                .and_then(|v| u16::try_from(v).ok());
            Ok(Account {
                username,
                password,
                pin,
            })
        }
        Some((found, _)) => Err(DecodeError::UnexpectedTag {
            field: "account",
            found,
        }),
        None => Err(DecodeError::Missing("account")),
    }
}

fn write_script(w: &mut RecordWriter, script: &Script) {
    w.write_object(tag::SCRIPT, |w| {
        w.write_string(&script.identifier);
        w.write_string(&script.parameters);
        w.write_bool(script.is_local);
        w.write_string(&script.nickname);
    });
}

fn script_from_body(body: &mut RecordReader<'_>) -> Result<Script, DecodeError> {
    Ok(Script {
        identifier: body.read_string("script.identifier")?,
        parameters: body.read_string("script.parameters")?,
        is_local: body.read_bool("script.is_local")?,
        nickname: body.soft_string("script.nickname"),
    })
}

fn read_scripts(r: &mut RecordReader<'_>) -> Result<Vec<Script>, DecodeError> {
    match r.read_object("scripts")? {
        Some((tag::LIST, mut body)) => {
            let count = body.read_u32("scripts.len")?;
            let mut scripts = Vec::new();
            for _ in 0..count {
                match body.read_object("script")? {
                    Some((tag::SCRIPT, mut s)) => scripts.push(script_from_body(&mut s)?),
                    Some((found, _)) => {
                        return Err(DecodeError::UnexpectedTag {
                            field: "script",
                            found,
                        });
                    }
                    None => return Err(DecodeError::Missing("script")),
                }
            }
            Ok(scripts)
        }
        // Oldest records held exactly one script.
        Some((tag::SCRIPT, mut body)) => Ok(vec![script_from_body(&mut body)?]),
        Some((found, _)) => Err(DecodeError::UnexpectedTag {
            field: "scripts",
            found,
        }),
        None => Ok(Vec::new()),
    }
}

fn write_proxy(w: &mut RecordWriter, proxy: Option<&Proxy>) {
    match proxy {
        None => w.write_null(),
        Some(Proxy::Basic {
            ip_address,
            port,
            nickname,
        }) => w.write_object(tag::PROXY, |w| {
            w.write_string(ip_address);
            w.write_i32(i32::from(*port));
            w.write_string(nickname);
        }),
        Some(Proxy::Authenticated {
            ip_address,
            port,
            username,
            password,
            nickname,
        }) => w.write_object(tag::SECURED_PROXY, |w| {
            w.write_string(ip_address);
            w.write_i32(i32::from(*port));
            w.write_string(username);
            w.write_string(password);
            w.write_string(nickname);
        }),
    }
}

fn read_port(r: &mut RecordReader<'_>, field: &'static str) -> Result<u16, DecodeError> {
    let v = r.read_i32(field)?;
    u16::try_from(v).map_err(|_| DecodeError::OutOfRange {
        field,
        value: i64::from(v),
    })
}

fn read_proxy(r: &mut RecordReader<'_>) -> Result<Option<Proxy>, DecodeError> {
    match r.read_object("proxy")? {
        None => Ok(None),
        Some((tag::PROXY, mut body)) => Ok(Some(Proxy::Basic {
            ip_address: body.read_string("proxy.ip_address")?,
            port: read_port(&mut body, "proxy.port")?,
            nickname: body.soft_string("proxy.nickname"),
        })),
        Some((tag::SECURED_PROXY, mut body)) => Ok(Some(Proxy::Authenticated {
            ip_address: body.read_string("proxy.ip_address")?,
            port: read_port(&mut body, "proxy.port")?,
            username: body.read_string("proxy.username")?,
            password: body.read_string("proxy.password")?,
            nickname: body.soft_string("proxy.nickname"),
        })),
        Some((found, _)) => Err(DecodeError::UnexpectedTag {
            field: "proxy",
            found,
        }),
    }
}

/// Rejects values that would not survive the store's signed 32-bit slots.
fn check_storable(c: &Configuration) -> Result<(), EncodeError> {
    if let Some(m) = c.memory_allocation.filter(|m| *m > Configuration::MAX_MEMORY) {
        return Err(EncodeError::OutOfRange {
            field: "memory_allocation",
            value: m,
            max: Configuration::MAX_MEMORY,
        });
    }
    if let Some(world) = c.worlds.iter().find(|w| w.number > World::MAX_NUMBER) {
        return Err(EncodeError::OutOfRange {
            field: "world.number",
            value: world.number,
            max: World::MAX_NUMBER,
        });
    }
    Ok(())
}

fn write_world(w: &mut RecordWriter, world: &World) {
    w.write_object(tag::WORLD, |w| {
        w.write_i32(i32::try_from(world.number).unwrap_or(-1));
        w.write_bool(world.members);
    });
}

fn read_worlds(
    r: &mut RecordReader<'_>,
    catalog: &dyn WorldCatalog,
) -> Result<Vec<Arc<World>>, DecodeError> {
    match r.read_object("worlds")? {
        Some((tag::LIST, mut body)) => {
            let count = body.read_u32("worlds.len")?;
            let mut worlds = Vec::new();
            for _ in 0..count {
                match body.read_object("world")? {
                    Some((tag::WORLD, mut w)) => {
                        let raw = w.read_i32("world.number")?;
                        let number = u32::try_from(raw).map_err(|_| DecodeError::OutOfRange {
                            field: "world.number",
                            value: i64::from(raw),
                        })?;
                        let members = w.soft_bool("world.members");
                        worlds.push(Arc::new(World { number, members }));
                    }
                    Some((found, _)) => {
                        return Err(DecodeError::UnexpectedTag {
                            field: "world",
                            found,
                        });
                    }
                    None => return Err(DecodeError::Missing("world")),
                }
            }
            Ok(worlds)
        }
        Some((tag::LEGACY_WORLD_TYPE, _)) => {
            r.read_i32("legacy world number")?;
            r.read_bool("legacy randomize world")?;
            let worlds = catalog.worlds();
            tracing::info!(
                worlds = worlds.len(),
                "upgraded single-world configuration to the full world catalog"
            );
            Ok(worlds)
        }
        Some((found, _)) => Err(DecodeError::UnexpectedTag {
            field: "worlds",
            found,
        }),
        None => Ok(Vec::new()),
    }
}

fn write_configuration(w: &mut RecordWriter, c: &Configuration) {
    w.write_object(tag::CONFIGURATION, |w| {
        write_account(w, &c.account);
        w.write_list(&c.scripts, |w, s| write_script(w, s));
        write_proxy(w, c.proxy.as_ref());
        w.write_i32(c.memory_allocation.and_then(|m| i32::try_from(m).ok()).unwrap_or(-1));
        w.write_bool(c.collect_data);
        w.write_bool(c.debug_mode);
        w.write_i32(c.debug_port.map_or(-1, i32::from));
        w.write_bool(c.low_cpu_mode);
        w.write_bool(c.low_resource_mode);
        w.write_list(&c.worlds, |w, world| write_world(w, world));
        // Additive fields, oldest first.
        w.write_bool(c.reflection);
        w.write_bool(c.no_randoms);
        w.write_bool(c.no_interface);
        w.write_bool(c.no_render);
        w.write_bool(c.dismiss_randoms);
        w.write_bool(c.new_mouse);
        w.write_bool(c.enable_breaks);
        w.write_bool(c.stop_after_break);
        w.write_bool(c.mirror_mode);
        w.write_bool(c.launch_game);
        w.write_bool(c.close_client);
        w.write_string(&c.log_file.to_string_lossy());
    });
}

fn read_configuration(
    r: &mut RecordReader<'_>,
    ctx: &DecodeContext<'_>,
) -> Result<Configuration, DecodeError> {
    let mut body = match r.read_object("configuration")? {
        Some((tag::CONFIGURATION, body)) => body,
        Some((found, _)) => {
            return Err(DecodeError::UnexpectedTag {
                field: "configuration",
                found,
            });
        }
        None => return Err(DecodeError::Missing("configuration")),
    };
    let r = &mut body;

    let account = Arc::new(read_account(r)?);
    let scripts = read_scripts(r)?
        .into_iter()
        .map(Arc::new)
        .collect();
    let proxy = read_proxy(r)?;
    let memory_allocation = u32::try_from(r.read_i32("memory_allocation")?).ok();
    let collect_data = r.read_bool("collect_data")?;
    let debug_mode = r.read_bool("debug_mode")?;
    let debug_port = match r.read_i32("debug_port")? {
        v if v < 0 => None,
        v => Some(u16::try_from(v).map_err(|_| DecodeError::OutOfRange {
            field: "debug_port",
            value: i64::from(v),
        })?),
    };
    let low_cpu_mode = r.read_bool("low_cpu_mode")?;
    let low_resource_mode = r.read_bool("low_resource_mode")?;
    let worlds = read_worlds(r, ctx.catalog)?;

    let reflection = r.soft_bool("reflection");
    let no_randoms = r.soft_bool("no_randoms");
    let no_interface = r.soft_bool("no_interface");
    let no_render = r.soft_bool("no_render");
    let dismiss_randoms = r.soft_bool("dismiss_randoms");
    let new_mouse = r.soft_bool("new_mouse");
    let enable_breaks = r.soft_bool("enable_breaks");
    let stop_after_break = r.soft_bool("stop_after_break");
    let mirror_mode = r.soft_bool("mirror_mode");
    let launch_game = r.soft_bool("launch_game");
    let close_client = r.soft_bool("close_client");

    let stored_log = r.soft_string("log_file");
    let log_file = if !stored_log.is_empty() && Path::new(&stored_log).exists() {
        stored_log.into()
    } else {
        new_log_file(ctx.logs_dir)
    };

    Ok(Configuration {
        account,
        scripts,
        proxy,
        worlds,
        memory_allocation,
        collect_data,
        debug_mode,
        debug_port,
        low_cpu_mode,
        low_resource_mode,
        dismiss_randoms,
        reflection,
        no_randoms,
        no_interface,
        no_render,
        new_mouse,
        enable_breaks,
        stop_after_break,
        mirror_mode,
        launch_game,
        close_client,
        log_file,
        run_state: Arc::new(RunState::new()),
    })
}

/// Encodes a single configuration record.
pub fn encode_configuration(config: &Configuration) -> Result<Vec<u8>, EncodeError> {
    check_storable(config)?;
    let mut w = RecordWriter::default();
    write_configuration(&mut w, config);
    Ok(w.into_bytes())
}

pub fn decode_configuration(data: &[u8], ctx: &DecodeContext<'_>) -> anyhow::Result<Configuration> {
    let mut r = RecordReader::new(data);
    Ok(read_configuration(&mut r, ctx)?)
}

pub fn encode_store(configs: &[Configuration]) -> anyhow::Result<Vec<u8>> {
    let mut w = RecordWriter::default();
    w.buf.extend_from_slice(MAGIC);
    w.write_u16(STORE_VERSION);
    w.write_u32(configs.len() as u32);
    for (i, c) in configs.iter().enumerate() {
        check_storable(c).with_context(|| format!("encode configuration #{i}"))?;
        write_configuration(&mut w, c);
    }
    Ok(w.into_bytes())
}

pub fn decode_store(data: &[u8], ctx: &DecodeContext<'_>) -> anyhow::Result<Vec<Configuration>> {
    let mut r = RecordReader::new(data);
    if r.take(MAGIC.len(), "magic")? != MAGIC {
        return Err(DecodeError::BadMagic.into());
    }
    let version = r.read_u16("store version")?;
    if version > STORE_VERSION {
        return Err(DecodeError::UnsupportedVersion(version).into());
    }
    let count = r.read_u32("record count")?;
    let mut out = Vec::new();
    for i in 0..count {
        let c = read_configuration(&mut r, ctx).with_context(|| format!("decode configuration #{i}"))?;
        out.push(c);
    }
    Ok(out)
}

/// Writes the store atomically (temp file + rename).
pub fn save(path: &Path, configs: &[Configuration]) -> anyhow::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create {}", parent.display()))?;
    }
    let data = encode_store(configs)?;
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, data)
        .with_context(|| format!("write {}", tmp.display()))?;
    std::fs::rename(&tmp, path).with_context(|| format!("persist {}", path.display()))?;
    Ok(())
}

/// Loads the store at `path`; a missing file is an empty store.
pub fn load(path: &Path, ctx: &DecodeContext<'_>) -> anyhow::Result<Vec<Configuration>> {
    let data = match std::fs::read(path) {
        Ok(v) => v,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e).with_context(|| format!("read {}", path.display())),
    };
    decode_store(&data, ctx).with_context(|| format!("load {}", path.display()))
}

/// Loads the store for a session that will run or show its configurations.
///
/// Log files regenerated during decode are created and the store is written
/// back, so later loads keep the same paths.
pub fn open_store(path: &Path, ctx: &DecodeContext<'_>) -> anyhow::Result<Vec<Configuration>> {
    let configs = load(path, ctx)?;
    let mut created = 0;
    for c in configs.iter().filter(|c| !c.log_file().exists()) {
        c.ensure_log_file()
            .with_context(|| format!("create log file {}", c.log_file().display()))?;
        created += 1;
    }
    if created > 0 {
        tracing::info!(store = %path.display(), created, "saving regenerated log file paths");
        save(path, &configs)?;
    }
    Ok(configs)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use botrun_process::RunPhase;

    use super::*;
    use crate::StaticWorldCatalog;

    fn catalog() -> StaticWorldCatalog {
        StaticWorldCatalog::new(vec![
            World::new(301, false),
            World::new(302, true),
            World::new(303, false),
        ])
    }

    fn full_config(logs_dir: &Path) -> Configuration {
        let mut account = Account::new("alice", "pw");
        account.pin = Some(1234);
        let mut local = Script::new("Fisher", "lobster", true);
        local.nickname = "fish".to_string();
        let mut c = Configuration::new(
            Arc::new(account),
            vec![Arc::new(local), Arc::new(Script::new("991", "x", false))],
            logs_dir,
        );
        c.proxy = Some(Proxy::authenticated("10.0.0.1", 1080, "u", "p").with_nickname("vpn"));
        c.worlds = vec![Arc::new(World::new(301, false)), Arc::new(World::new(420, true))];
        c.memory_allocation = Some(4096);
        c.collect_data = true;
        c.debug_mode = true;
        c.debug_port = Some(9222);
        c.low_cpu_mode = true;
        c.low_resource_mode = true;
        c.dismiss_randoms = true;
        c.reflection = true;
        c.no_randoms = true;
        c.no_interface = true;
        c.no_render = true;
        c.new_mouse = true;
        c.enable_breaks = true;
        c.stop_after_break = true;
        c.mirror_mode = true;
        c.launch_game = true;
        c.close_client = true;
        c
    }

    fn assert_same(a: &Configuration, b: &Configuration) {
        assert_eq!(*a.account, *b.account);
        let sa: Vec<&Script> = a.scripts.iter().map(|s| &**s).collect();
        let sb: Vec<&Script> = b.scripts.iter().map(|s| &**s).collect();
        assert_eq!(sa, sb);
        assert_eq!(a.proxy, b.proxy);
        let wa: Vec<&World> = a.worlds.iter().map(|w| &**w).collect();
        let wb: Vec<&World> = b.worlds.iter().map(|w| &**w).collect();
        assert_eq!(wa, wb);
        assert_eq!(a.memory_allocation, b.memory_allocation);
        assert_eq!(a.collect_data, b.collect_data);
        assert_eq!(a.debug_mode, b.debug_mode);
        assert_eq!(a.debug_port, b.debug_port);
        assert_eq!(a.low_cpu_mode, b.low_cpu_mode);
        assert_eq!(a.low_resource_mode, b.low_resource_mode);
        assert_eq!(a.dismiss_randoms, b.dismiss_randoms);
        assert_eq!(a.reflection, b.reflection);
        assert_eq!(a.no_randoms, b.no_randoms);
        assert_eq!(a.no_interface, b.no_interface);
        assert_eq!(a.no_render, b.no_render);
        assert_eq!(a.new_mouse, b.new_mouse);
        assert_eq!(a.enable_breaks, b.enable_breaks);
        assert_eq!(a.stop_after_break, b.stop_after_break);
        assert_eq!(a.mirror_mode, b.mirror_mode);
        assert_eq!(a.launch_game, b.launch_game);
        assert_eq!(a.close_client, b.close_client);
    }

    /// Fields present since the first release, with worlds written by `worlds`.
    fn write_base_fields(w: &mut RecordWriter, worlds: impl FnOnce(&mut RecordWriter)) {
        write_account(w, &Account::new("old", "timer"));
        w.write_list(&[Script::new("123", "", false)], |w, s| write_script(w, s));
        w.write_null();
        w.write_i32(-1);
        w.write_bool(true);
        w.write_bool(false);
        w.write_i32(-1);
        w.write_bool(true);
        w.write_bool(false);
        worlds(w);
    }

    fn legacy_worlds(w: &mut RecordWriter) {
        w.write_object(tag::LEGACY_WORLD_TYPE, |w| w.write_string("MEMBERS"));
        w.write_i32(302);
        w.write_bool(true);
    }

    fn store_of(records: impl FnOnce(&mut RecordWriter), count: u32) -> Vec<u8> {
        let mut w = RecordWriter::default();
        w.buf.extend_from_slice(MAGIC);
        w.write_u16(STORE_VERSION);
        w.write_u32(count);
        records(&mut w);
        w.into_bytes()
    }

    #[test]
    fn round_trip_preserves_everything_but_runtime_state() {
        let dir = tempfile::tempdir().unwrap();
        let c = full_config(dir.path());
        std::fs::write(c.log_file(), b"previous run").unwrap();
        c.run_state().set_phase(RunPhase::Running);
        c.run_state().set_pid(Some(4242));

        let cat = catalog();
        let ctx = DecodeContext {
            catalog: &cat,
            logs_dir: dir.path(),
        };
        let decoded = decode_configuration(&encode_configuration(&c).unwrap(), &ctx).unwrap();

        assert_same(&c, &decoded);
        assert_eq!(decoded.log_file(), c.log_file());
        assert!(!decoded.is_running());
        assert_eq!(decoded.run_state().pid(), None);
    }

    #[test]
    fn missing_log_file_is_regenerated() {
        let dir = tempfile::tempdir().unwrap();
        let c = Configuration::new(
            Arc::new(Account::new("a", "b")),
            vec![],
            Path::new("/nonexistent/botrun/logs"),
        );
        let cat = catalog();
        let ctx = DecodeContext {
            catalog: &cat,
            logs_dir: dir.path(),
        };
        let decoded = decode_configuration(&encode_configuration(&c).unwrap(), &ctx).unwrap();
        assert_ne!(decoded.log_file(), c.log_file());
        assert_eq!(decoded.log_file().parent(), Some(dir.path()));
    }

    #[test]
    fn legacy_single_world_upgrades_to_full_catalog() {
        let dir = tempfile::tempdir().unwrap();
        let mut w = RecordWriter::default();
        w.write_object(tag::CONFIGURATION, |w| write_base_fields(w, legacy_worlds));
        let cat = catalog();
        let ctx = DecodeContext {
            catalog: &cat,
            logs_dir: dir.path(),
        };
        let decoded = decode_configuration(&w.into_bytes(), &ctx).unwrap();
        let numbers: Vec<u32> = decoded.worlds.iter().map(|w| w.number).collect();
        assert_eq!(numbers, vec![301, 302, 303]);
    }

    #[test]
    fn record_truncated_after_base_fields_defaults_additive_fields() {
        let dir = tempfile::tempdir().unwrap();
        let mut w = RecordWriter::default();
        w.write_object(tag::CONFIGURATION, |w| {
            write_base_fields(w, |w| {
                w.write_list(&[World::new(333, false)], |w, world| write_world(w, world))
            })
        });
        let cat = catalog();
        let ctx = DecodeContext {
            catalog: &cat,
            logs_dir: dir.path(),
        };
        let c = decode_configuration(&w.into_bytes(), &ctx).unwrap();

        assert_eq!(c.account.username, "old");
        assert!(c.collect_data);
        assert!(c.low_cpu_mode);
        assert_eq!(c.memory_allocation, None);
        assert_eq!(c.debug_port, None);
        assert_eq!(c.worlds.len(), 1);
        for flag in [
            c.reflection,
            c.no_randoms,
            c.no_interface,
            c.no_render,
            c.dismiss_randoms,
            c.new_mouse,
            c.enable_breaks,
            c.stop_after_break,
            c.mirror_mode,
            c.launch_game,
            c.close_client,
        ] {
            assert!(!flag);
        }
        assert_eq!(c.scripts[0].nickname, "");
        assert_eq!(c.log_file().parent(), Some(dir.path()));
        assert!(!c.is_running());
    }

    #[test]
    fn legacy_single_script_becomes_list() {
        let dir = tempfile::tempdir().unwrap();
        let mut w = RecordWriter::default();
        w.write_object(tag::CONFIGURATION, |w| {
            write_account(w, &Account::new("a", "b"));
            // Script record from before nicknames existed.
            w.write_object(tag::SCRIPT, |w| {
                w.write_string("Agility");
                w.write_string("");
                w.write_bool(true);
            });
            w.write_null();
            w.write_i32(2048);
            w.write_bool(false);
            w.write_bool(false);
            w.write_i32(-1);
            w.write_bool(false);
            w.write_bool(false);
            legacy_worlds(w);
        });
        let cat = catalog();
        let ctx = DecodeContext {
            catalog: &cat,
            logs_dir: dir.path(),
        };
        let c = decode_configuration(&w.into_bytes(), &ctx).unwrap();
        assert_eq!(c.scripts.len(), 1);
        assert_eq!(c.scripts[0].identifier, "Agility");
        assert!(c.scripts[0].is_local);
        assert_eq!(c.scripts[0].nickname, "");
        assert_eq!(c.memory_allocation, Some(2048));
    }

    #[test]
    fn proxy_without_nickname_decodes_to_empty() {
        let mut w = RecordWriter::default();
        w.write_object(tag::PROXY, |w| {
            w.write_string("5.6.7.8");
            w.write_i32(8080);
        });
        w.write_object(tag::SECURED_PROXY, |w| {
            w.write_string("5.6.7.9");
            w.write_i32(8081);
            w.write_string("user");
            w.write_string("pass");
        });
        let bytes = w.into_bytes();
        let mut r = RecordReader::new(&bytes);
        let basic = read_proxy(&mut r).unwrap().unwrap();
        assert_eq!(basic, Proxy::basic("5.6.7.8", 8080));
        let secured = read_proxy(&mut r).unwrap().unwrap();
        assert_eq!(secured, Proxy::authenticated("5.6.7.9", 8081, "user", "pass"));
        assert_eq!(secured.nickname(), "");
    }

    #[test]
    fn short_old_record_does_not_bleed_into_next() {
        let dir = tempfile::tempdir().unwrap();
        let full = full_config(dir.path());
        let data = store_of(
            |w| {
                w.write_object(tag::CONFIGURATION, |w| write_base_fields(w, legacy_worlds));
                write_configuration(w, &full);
            },
            2,
        );
        let cat = catalog();
        let ctx = DecodeContext {
            catalog: &cat,
            logs_dir: dir.path(),
        };
        let configs = decode_store(&data, &ctx).unwrap();
        assert_eq!(configs.len(), 2);
        assert!(!configs[0].close_client);
        assert_same(&full, &configs[1]);
    }

    #[test]
    fn truncated_core_field_is_a_hard_error() {
        let dir = tempfile::tempdir().unwrap();
        let c = full_config(dir.path());
        let mut bytes = encode_configuration(&c).unwrap();
        // Cut inside the account record and fix up the outer length.
        bytes.truncate(12);
        let body_len = (bytes.len() - 5) as u32;
        bytes[1..5].copy_from_slice(&body_len.to_be_bytes());
        let cat = catalog();
        let ctx = DecodeContext {
            catalog: &cat,
            logs_dir: dir.path(),
        };
        let err = decode_configuration(&bytes, &ctx).unwrap_err();
        assert!(err.to_string().contains("unexpected end of data"));
    }

    #[test]
    fn unknown_proxy_tag_is_rejected() {
        let mut w = RecordWriter::default();
        w.write_object(0x99, |_| {});
        let bytes = w.into_bytes();
        let err = read_proxy(&mut RecordReader::new(&bytes)).unwrap_err();
        assert!(matches!(err, DecodeError::UnexpectedTag { field: "proxy", found: 0x99 }));
    }

    #[test]
    fn bad_magic_and_future_version_are_rejected() {
        let cat = catalog();
        let ctx = DecodeContext {
            catalog: &cat,
            logs_dir: Path::new("."),
        };
        let err = decode_store(b"NOPE\0\x01\0\0\0\0", &ctx).unwrap_err();
        assert!(err.to_string().contains("not a configuration store"));

        let mut data = MAGIC.to_vec();
        data.extend_from_slice(&9u16.to_be_bytes());
        data.extend_from_slice(&0u32.to_be_bytes());
        let err = decode_store(&data, &ctx).unwrap_err();
        assert!(err.to_string().contains("unsupported store version 9"));
    }

    #[test]
    fn save_then_load_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store").join("configurations.bin");
        let cat = catalog();
        let ctx = DecodeContext {
            catalog: &cat,
            logs_dir: dir.path(),
        };
        assert!(load(&path, &ctx).unwrap().is_empty());

        let configs = vec![full_config(dir.path()), full_config(dir.path())];
        save(&path, &configs).unwrap();
        let loaded = load(&path, &ctx).unwrap();
        assert_eq!(loaded.len(), 2);
        assert_same(&configs[0], &loaded[0]);
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn largest_storable_numbers_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = full_config(dir.path());
        c.worlds = vec![Arc::new(World::new(World::MAX_NUMBER, true))];
        c.memory_allocation = Some(Configuration::MAX_MEMORY);
        let cat = catalog();
        let ctx = DecodeContext {
            catalog: &cat,
            logs_dir: dir.path(),
        };
        let decoded = decode_configuration(&encode_configuration(&c).unwrap(), &ctx).unwrap();
        assert_eq!(decoded.worlds[0].number, World::MAX_NUMBER);
        assert_eq!(decoded.memory_allocation, Some(Configuration::MAX_MEMORY));
    }

    #[test]
    fn unstorable_numbers_fail_the_save_and_keep_the_old_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("configurations.bin");
        let cat = catalog();
        let ctx = DecodeContext {
            catalog: &cat,
            logs_dir: dir.path(),
        };
        save(&path, &[full_config(dir.path())]).unwrap();

        let mut bad_world = full_config(dir.path());
        bad_world.worlds = vec![Arc::new(World::new(3_000_000_000, false))];
        let err = save(&path, &[full_config(dir.path()), bad_world]).unwrap_err();
        assert!(format!("{err:#}").contains("world.number out of range: 3000000000"));

        let mut bad_memory = full_config(dir.path());
        bad_memory.memory_allocation = Some(u32::MAX);
        assert!(matches!(
            encode_configuration(&bad_memory),
            Err(EncodeError::OutOfRange {
                field: "memory_allocation",
                ..
            })
        ));

        assert_eq!(load(&path, &ctx).unwrap().len(), 1);
    }

    #[test]
    fn open_store_keeps_log_paths_stable_across_loads() {
        let dir = tempfile::tempdir().unwrap();
        let logs = dir.path().join("logs");
        let path = dir.path().join("configurations.bin");
        let cat = catalog();
        let ctx = DecodeContext {
            catalog: &cat,
            logs_dir: &logs,
        };
        // A freshly created configuration has no log file on disk yet.
        save(&path, &[full_config(&logs)]).unwrap();

        let first = open_store(&path, &ctx).unwrap();
        assert!(first[0].log_file().is_file());
        let second = open_store(&path, &ctx).unwrap();
        let third = load(&path, &ctx).unwrap();
        assert_eq!(second[0].log_file(), first[0].log_file());
        assert_eq!(third[0].log_file(), first[0].log_file());
    }
}
