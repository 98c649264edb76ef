use std::collections::HashMap;
use std::path::Path;

use blazesym::symbolize::source::{Process, Source};
use blazesym::symbolize::{Input, Sym, Symbolized, Symbolizer};
use blazesym::{Addr, Pid};
use log::debug;

use crate::records::StackId;
use crate::table::StackTraceTable;

const ADDR_WIDTH: usize = 16;
const UNKNOWN_SYMBOL: &str = "[unknown]";

/// Rendered in reports in place of a stack whose id no longer resolves.
pub const STACK_LOST: &str = "stack information lost";

/// How a resolved frame is rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameStyle {
    /// `0x00007f12deadbeef libc.so.6!malloc+0x1a`
    Detailed,
    /// `malloc+0x1a`
    Function,
}

/// Maps instruction addresses of a process to printable frames.
pub trait Symbolize {
    /// Returns exactly one string per address, in input order.
    fn symbolize(&mut self, pid: u32, addrs: &[Addr], style: FrameStyle) -> Vec<String>;
}

fn format_frame(input_addr: Addr, sym: &Symbolized<'_>, style: FrameStyle) -> String {
    match (sym, style) {
        (
            Symbolized::Sym(Sym {
                name,
                module,
                offset,
                ..
            }),
            FrameStyle::Detailed,
        ) => {
            let module = module
                .as_deref()
                .and_then(|m| Path::new(m).file_name())
                .map(|m| m.to_string_lossy().to_string())
                .unwrap_or_else(|| UNKNOWN_SYMBOL.to_string());
            format!(
                "0x{input_addr:0width$x} {module}!{name}+{offset:#x}",
                width = ADDR_WIDTH
            )
        }
        (Symbolized::Sym(Sym { name, offset, .. }), FrameStyle::Function) => {
            format!("{name}+{offset:#x}")
        }
        (Symbolized::Unknown(_), style) => format_unknown(input_addr, style),
    }
}

fn format_unknown(input_addr: Addr, style: FrameStyle) -> String {
    match style {
        FrameStyle::Detailed => {
            format!("0x{input_addr:0width$x} {UNKNOWN_SYMBOL}", width = ADDR_WIDTH)
        }
        FrameStyle::Function => UNKNOWN_SYMBOL.to_string(),
    }
}

/// blazesym backed symbolizer with one process source per pid.
pub struct BlazeSymbolizer {
    symbolizer: Symbolizer,
    src_cache: HashMap<u32, Source<'static>>,
}

impl Default for BlazeSymbolizer {
    fn default() -> Self {
        Self::new()
    }
}

impl BlazeSymbolizer {
    pub fn new() -> Self {
        BlazeSymbolizer {
            symbolizer: Symbolizer::new(),
            src_cache: HashMap::new(),
        }
    }
}

impl Symbolize for BlazeSymbolizer {
    fn symbolize(&mut self, pid: u32, addrs: &[Addr], style: FrameStyle) -> Vec<String> {
        let src = self
            .src_cache
            .entry(pid)
            .or_insert_with(|| Source::Process(Process::new(Pid::from(pid))));

        match self.symbolizer.symbolize(src, Input::AbsAddr(addrs)) {
            Ok(syms) => addrs
                .iter()
                .copied()
                .zip(syms.iter())
                .map(|(addr, sym)| format_frame(addr, sym, style))
                .collect(),
            Err(e) => {
                debug!("failed to symbolize {} addresses for pid {pid}: {e}", addrs.len());
                addrs
                    .iter()
                    .map(|addr| format_unknown(*addr, style))
                    .collect()
            }
        }
    }
}

/// Resolves stack ids of one target into symbol strings.
///
/// Meant to live for a single harvest cycle: results are cached per stack id
/// and style, and the cache goes away with the resolver so a recycled stack id
/// is never served from a previous cycle.
pub struct StackResolver<'a> {
    stacks: &'a dyn StackTraceTable,
    symbolizer: &'a mut dyn Symbolize,
    pid: u32,
    cache: HashMap<(StackId, FrameStyle), Vec<String>>,
}

impl<'a> StackResolver<'a> {
    pub fn new(
        stacks: &'a dyn StackTraceTable,
        symbolizer: &'a mut dyn Symbolize,
        pid: u32,
    ) -> Self {
        StackResolver {
            stacks,
            symbolizer,
            pid,
            cache: HashMap::new(),
        }
    }

    /// Symbolized frames of `stack_id`, innermost first. Empty when the id is
    /// stale or invalid; callers render that as [`STACK_LOST`].
    pub fn resolve(&mut self, stack_id: StackId, style: FrameStyle) -> Vec<String> {
        if let Some(frames) = self.cache.get(&(stack_id, style)) {
            return frames.clone();
        }

        let addrs = match self.stacks.walk(stack_id) {
            Ok(Some(addrs)) => addrs,
            Ok(None) => {
                debug!("stack id {stack_id} no longer in the stack table");
                Vec::new()
            }
            Err(e) => {
                debug!("failed to walk stack id {stack_id}: {e}");
                Vec::new()
            }
        };
        let addrs: Vec<Addr> = addrs.into_iter().take_while(|addr| *addr != 0).collect();
        let frames = if addrs.is_empty() {
            Vec::new()
        } else {
            self.symbolizer.symbolize(self.pid, &addrs, style)
        };

        self.cache.insert((stack_id, style), frames.clone());
        frames
    }

    /// Like [`resolve`](Self::resolve), but a lost stack comes back as a
    /// single [`STACK_LOST`] frame so reports never silently drop it.
    pub fn resolve_marked(&mut self, stack_id: StackId, style: FrameStyle) -> Vec<String> {
        let frames = self.resolve(stack_id, style);
        if frames.is_empty() {
            vec![STACK_LOST.to_string()]
        } else {
            frames
        }
    }

    /// Number of stacks currently held by the stack table.
    pub fn stack_table_size(&self) -> crate::error::Result<usize> {
        self.stacks.len()
    }
}
