//! Shared helpers for the unit tests.

use std::collections::HashMap;

use crate::symbolize::{FrameStyle, Symbolize};

/// Symbolizer that names every address `fn_<hex addr>` unless an alias was
/// registered for it, and records how it was called.
#[derive(Default)]
pub struct NameSymbolizer {
    pub calls: usize,
    pub pids: Vec<u32>,
    aliases: HashMap<u64, String>,
}

impl NameSymbolizer {
    pub fn alias(mut self, addr: u64, name: &str) -> Self {
        self.aliases.insert(addr, name.to_string());
        self
    }
}

impl Symbolize for NameSymbolizer {
    fn symbolize(&mut self, pid: u32, addrs: &[u64], style: FrameStyle) -> Vec<String> {
        self.calls += 1;
        self.pids.push(pid);
        addrs
            .iter()
            .map(|addr| {
                let name = self
                    .aliases
                    .get(addr)
                    .cloned()
                    .unwrap_or_else(|| format!("fn_{addr:x}"));
                match style {
                    FrameStyle::Detailed => format!("0x{addr:016x} app!{name}+0x0"),
                    FrameStyle::Function => format!("{name}+0x0"),
                }
            })
            .collect()
    }
}
