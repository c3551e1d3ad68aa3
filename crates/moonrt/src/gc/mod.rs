// The collector: incremental tri-color mark-sweep with an optional
// generational mode.
//
// Invariant while marking: no black object references a white object. The
// sweep may violate it temporarily; it is restored before the next cycle
// starts marking. Writes that would break it route through the barriers:
// closures, upvalues, userdata and metatable writes use the forward barrier
// (mark the new referent now); table element writes use the back barrier
// (repaint the table gray and rescan it at the atomic step).
//
// Work is driven by allocation debt. Every allocation raises the debt; when
// it goes positive the next checkpoint runs one slice of the state machine:
//
//   Pause -> Propagate -> EnterAtomic -> SwpAllGc -> SwpFinObj
//         -> SwpToBeFnz -> SwpEnd -> CallFin -> Pause
//
// The atomic step finishes marking, processes weak tables (ephemeron
// fixpoint included), separates unreachable finalizable objects into the
// to-be-finalized queue, and flips the white generation. Finalizers run one
// per slice, in protected frames driven by the state (the collector itself
// never calls script code).

pub mod header;
pub mod interner;
pub mod pool;

pub use crate::gc::header::GcHeader;

use crate::gc::header::{
    AGE_NEW, AGE_OLD, AGE_OLD0, AGE_OLD1, AGE_SURVIVAL, AGE_TOUCHED1, AGE_TOUCHED2,
};
use crate::gc::pool::{GcRef, ObjectPool, StrRef, TableRef, ThreadRef};
use crate::value::func::{Closure, Upvalue};
use crate::value::Value;

/// Indices into the parameter array.
pub const PARAM_PAUSE: usize = 0;
pub const PARAM_STEPMUL: usize = 1;
pub const PARAM_STEPSIZE: usize = 2;
pub const PARAM_MINORMUL: usize = 3;
pub const PARAM_MINORMAJOR: usize = 4;
pub const PARAM_MAJORMINOR: usize = 5;
pub const PARAM_COUNT: usize = 6;

// Defaults, as percentage points (stepsize is in kilobytes).
const DEFAULT_PAUSE: u32 = 200;
const DEFAULT_STEPMUL: u32 = 200;
const DEFAULT_STEPSIZE: u32 = 13;
const DEFAULT_MINORMUL: u32 = 20;
const DEFAULT_MINORMAJOR: u32 = 100;
const DEFAULT_MAJORMINOR: u32 = 100;

/// Objects swept per slice.
const SWEEP_MAX: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcKind {
    Incremental,
    GenMinor,
    GenMajor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcState {
    Propagate,
    EnterAtomic,
    SwpAllGc,
    SwpFinObj,
    SwpToBeFnz,
    SwpEnd,
    CallFin,
    Pause,
}

impl GcState {
    pub fn is_sweep(self) -> bool {
        matches!(
            self,
            GcState::SwpAllGc | GcState::SwpFinObj | GcState::SwpToBeFnz | GcState::SwpEnd
        )
    }

    /// While this holds, the black-to-white invariant must be preserved.
    pub fn keep_invariant(self) -> bool {
        matches!(self, GcState::Propagate | GcState::EnterAtomic)
    }
}

/// What a slice asks of the driver.
pub enum StepOutcome {
    /// Keep allocating; nothing else to do now.
    Done,
    /// A finalizable object is queued; the driver must run its `__gc`
    /// through `take_finalizable` and a protected call.
    RunFinalizer,
}

/// GC parameters live as "floating-point bytes": a 4-bit exponent and 4-bit
/// mantissa, scaled by 128/100 so one byte spans percentages 0..~39680.
/// decode(b) = (0x10 | mantissa) << (exponent - 1), or just the mantissa
/// when the exponent is zero.
pub fn code_param(percent: u32) -> u8 {
    let p = (percent as u64 * 128) / 100;
    if p < 0x10 {
        p as u8
    } else {
        let mut v = p;
        let mut e = 0u8;
        while v >= 0x20 {
            v >>= 1;
            e += 1;
        }
        if e + 1 > 0xF {
            0xFF
        } else {
            ((v as u8) & 0xF) | ((e + 1) << 4)
        }
    }
}

pub fn decode_param(b: u8) -> u64 {
    let m = (b & 0xF) as u64;
    let e = (b >> 4) as u64;
    if e == 0 {
        m
    } else {
        (0x10 | m) << (e - 1)
    }
}

/// x scaled by the percentage stored in `b`.
pub fn apply_param(b: u8, x: isize) -> isize {
    ((x as i128 * decode_param(b) as i128) / 128) as isize
}

#[derive(Debug, Clone, Default)]
pub struct GcStats {
    pub cycles: usize,
    pub minor_collections: usize,
    pub major_collections: usize,
    pub objects_collected: usize,
    pub emergency_collections: usize,
}

pub struct Gc {
    /// Bytes allocated but not yet paid for; a positive value triggers work.
    pub(crate) debt: isize,
    /// Estimated live bytes (allocations minus frees).
    pub(crate) total_bytes: isize,
    /// Bytes visited by marking in the current cycle.
    marked: isize,

    pub(crate) state: GcState,
    pub(crate) kind: GcKind,
    pub(crate) current_white: u8,
    /// Stopped by the host (gc("stop")).
    pub(crate) stopped: bool,
    /// Emergency collection in progress: no finalizers, no mode changes.
    emergency: bool,
    /// Blocks reentrant slices while a finalizer runs.
    pub(crate) stopem: bool,

    pub(crate) params: [u8; PARAM_COUNT],

    // Work lists.
    gray: Vec<GcRef>,
    grayagain: Vec<GcRef>,
    weak: Vec<TableRef>,
    ephemeron: Vec<TableRef>,
    allweak: Vec<TableRef>,

    // Object lists.
    allgc: Vec<GcRef>,
    finobj: Vec<GcRef>,
    tobefnz: Vec<GcRef>,

    // Sweep cursors (order-preserving compaction).
    sweep_read: usize,
    sweep_write: usize,

    /// First young object in `allgc` (generational mode).
    gen_boundary: usize,

    /// Interned "__mode" string, set once the string table exists.
    pub(crate) mode_key: Option<StrRef>,

    pub stats: GcStats,
}

impl Gc {
    pub fn new() -> Self {
        Gc {
            debt: -(8 * 1024),
            total_bytes: 0,
            marked: 0,
            state: GcState::Pause,
            kind: GcKind::Incremental,
            current_white: 0,
            stopped: false,
            emergency: false,
            stopem: false,
            params: [
                code_param(DEFAULT_PAUSE),
                code_param(DEFAULT_STEPMUL),
                code_param(DEFAULT_STEPSIZE),
                code_param(DEFAULT_MINORMUL),
                code_param(DEFAULT_MINORMAJOR),
                code_param(DEFAULT_MAJORMINOR),
            ],
            gray: Vec::with_capacity(64),
            grayagain: Vec::with_capacity(32),
            weak: Vec::new(),
            ephemeron: Vec::new(),
            allweak: Vec::new(),
            allgc: Vec::with_capacity(128),
            finobj: Vec::new(),
            tobefnz: Vec::new(),
            sweep_read: 0,
            sweep_write: 0,
            gen_boundary: 0,
            mode_key: None,
            stats: GcStats::default(),
        }
    }

    /// Header for a new object: always current white, age NEW.
    #[inline]
    pub fn new_header(&self, size: u32) -> GcHeader {
        GcHeader::new(self.current_white, size)
    }

    /// Link a freshly allocated object and account for its footprint.
    #[inline]
    pub fn register(&mut self, r: GcRef, size: usize) {
        self.allgc.push(r);
        self.debt += size as isize;
        self.total_bytes += size as isize;
    }

    #[inline]
    pub fn account_free(&mut self, size: usize) {
        self.total_bytes -= size as isize;
    }

    #[inline]
    pub fn should_step(&self) -> bool {
        self.debt > 0 && !self.stopped && !self.stopem
    }

    pub fn set_debt(&mut self, debt: isize) {
        self.debt = debt;
    }

    pub fn total_allocated(&self) -> isize {
        self.total_bytes
    }

    /// Move an object with a `__gc` metamethod to the finalizable list.
    /// Once there it stays until finalized, even if the metatable changes.
    pub fn mark_for_finalization(&mut self, r: GcRef, pool: &mut ObjectPool) {
        let header = pool.header_mut(r);
        if header.finalization_pending() || header.is_fixed() {
            return;
        }
        header.set_finalized();
        if let Some(pos) = self.allgc.iter().position(|&x| x == r) {
            // Keep sweep cursors consistent when pulling from mid-list.
            self.allgc.remove(pos);
            if self.state == GcState::SwpAllGc {
                if pos < self.sweep_read {
                    self.sweep_read -= 1;
                }
                if pos < self.sweep_write {
                    self.sweep_write -= 1;
                }
            }
            self.finobj.push(r);
        }
    }

    /// Pop one queued finalizable, relinking it into `allgc`.
    pub fn take_finalizable(&mut self) -> Option<GcRef> {
        let r = self.tobefnz.pop()?;
        self.allgc.push(r);
        Some(r)
    }

    pub fn has_pending_finalizers(&self) -> bool {
        !self.tobefnz.is_empty()
    }

    // ================= stepping =================

    /// One increment of work, driven from an allocation checkpoint.
    pub fn step(&mut self, roots: &[Value], pool: &mut ObjectPool) -> StepOutcome {
        match self.kind {
            GcKind::Incremental | GcKind::GenMajor => self.incremental_step(roots, pool),
            GcKind::GenMinor => {
                self.young_collection(roots, pool);
                self.set_minor_debt();
                StepOutcome::Done
            }
        }
    }

    fn incremental_step(&mut self, roots: &[Value], pool: &mut ObjectPool) -> StepOutcome {
        let stepsize = apply_param(self.params[PARAM_STEPSIZE], 100) * 1024;
        let mut work = apply_param(self.params[PARAM_STEPMUL], self.debt.max(1));
        let fast = work == 0;
        loop {
            let (done, outcome) = self.single_step(roots, pool, fast);
            if matches!(outcome, StepOutcome::RunFinalizer) {
                return StepOutcome::RunFinalizer;
            }
            work -= done;
            if self.state == GcState::Pause {
                if self.kind == GcKind::GenMajor {
                    // Major cycle finished; drop back to minor collections
                    // with everything alive forming the old generation.
                    for i in 0..self.allgc.len() {
                        let r = self.allgc[i];
                        pool.header_mut(r).set_age(AGE_OLD);
                    }
                    self.gen_boundary = self.allgc.len();
                    self.kind = GcKind::GenMinor;
                    self.set_minor_debt();
                } else {
                    self.set_pause();
                }
                return StepOutcome::Done;
            }
            if !fast && work <= 0 {
                self.set_debt(-stepsize);
                return StepOutcome::Done;
            }
        }
    }

    /// One state-machine transition. Returns (work done, outcome).
    fn single_step(
        &mut self,
        roots: &[Value],
        pool: &mut ObjectPool,
        fast: bool,
    ) -> (isize, StepOutcome) {
        match self.state {
            GcState::Pause => {
                self.restart_collection(roots, pool);
                self.state = GcState::Propagate;
                (1, StepOutcome::Done)
            }
            GcState::Propagate => {
                if self.gray.is_empty() {
                    self.state = GcState::EnterAtomic;
                    (1, StepOutcome::Done)
                } else if fast {
                    let mut w = 0;
                    while !self.gray.is_empty() {
                        w += self.propagate_one(pool);
                    }
                    (w, StepOutcome::Done)
                } else {
                    (self.propagate_one(pool), StepOutcome::Done)
                }
            }
            GcState::EnterAtomic => {
                let w = self.atomic(roots, pool);
                self.enter_sweep();
                (w, StepOutcome::Done)
            }
            GcState::SwpAllGc | GcState::SwpFinObj | GcState::SwpToBeFnz => {
                let budget = if fast { usize::MAX } else { SWEEP_MAX };
                let (w, complete) = self.sweep_slice(pool, budget);
                if complete {
                    self.state = match self.state {
                        GcState::SwpAllGc => GcState::SwpFinObj,
                        GcState::SwpFinObj => GcState::SwpToBeFnz,
                        _ => GcState::SwpEnd,
                    };
                    self.sweep_read = 0;
                    self.sweep_write = 0;
                }
                (w as isize, StepOutcome::Done)
            }
            GcState::SwpEnd => {
                pool.strtab.shrink_if_sparse();
                self.state = GcState::CallFin;
                (SWEEP_MAX as isize, StepOutcome::Done)
            }
            GcState::CallFin => {
                if !self.tobefnz.is_empty() && !self.emergency {
                    (1, StepOutcome::RunFinalizer)
                } else {
                    self.state = GcState::Pause;
                    self.stats.cycles += 1;
                    (1, StepOutcome::Done)
                }
            }
        }
    }

    fn enter_sweep(&mut self) {
        self.state = GcState::SwpAllGc;
        self.sweep_read = 0;
        self.sweep_write = 0;
    }

    /// Debt for the pause between cycles, from the `pause` parameter.
    fn set_pause(&mut self) {
        let threshold = apply_param(self.params[PARAM_PAUSE], self.marked.max(1));
        self.set_debt(self.total_bytes - threshold.max(self.total_bytes / 2));
    }

    fn set_minor_debt(&mut self) {
        let base = self.total_bytes.max(64 * 1024);
        self.set_debt(-apply_param(self.params[PARAM_MINORMUL], base));
    }

    /// Run a full cycle right now. Used by gc("collect"), mode switches and
    /// emergency collections.
    pub fn full_collection(&mut self, roots: &[Value], pool: &mut ObjectPool, emergency: bool) {
        self.emergency = emergency;
        if emergency {
            self.stats.emergency_collections += 1;
        }
        // Finish an interrupted cycle first so sweeping state is clean.
        if self.state != GcState::Pause {
            self.run_until_pause(roots, pool);
        }
        self.run_until_pause(roots, pool);
        self.set_pause();
        self.emergency = false;
        self.stats.major_collections += 1;
    }

    fn run_until_pause(&mut self, roots: &[Value], pool: &mut ObjectPool) {
        loop {
            let (_, outcome) = self.single_step(roots, pool, true);
            if matches!(outcome, StepOutcome::RunFinalizer) {
                // Finalizers run from the driver; a direct cycle skips them
                // here and leaves them queued.
                self.state = GcState::Pause;
                self.stats.cycles += 1;
                return;
            }
            if self.state == GcState::Pause {
                return;
            }
        }
    }

    /// Switch collector modes, finishing outstanding work first.
    pub fn set_kind(&mut self, kind: GcKind, roots: &[Value], pool: &mut ObjectPool) {
        if self.kind == kind {
            return;
        }
        if self.state != GcState::Pause {
            self.run_until_pause(roots, pool);
        }
        if kind == GcKind::GenMinor {
            // Everything alive now forms the old generation.
            self.full_collection(roots, pool, false);
            for &r in &self.allgc {
                pool.header_mut(r).set_age(AGE_OLD);
            }
            self.gen_boundary = self.allgc.len();
            self.set_minor_debt();
        }
        self.kind = kind;
    }

    // ================= marking =================

    fn restart_collection(&mut self, roots: &[Value], pool: &mut ObjectPool) {
        self.gray.clear();
        self.grayagain.clear();
        self.weak.clear();
        self.ephemeron.clear();
        self.allweak.clear();
        self.marked = 0;
        self.whiten_all(pool);
        for v in roots {
            self.mark_value(*v, pool);
        }
    }

    fn whiten_all(&mut self, pool: &mut ObjectPool) {
        let white = self.current_white;
        for list in [&self.allgc, &self.finobj, &self.tobefnz] {
            for &r in list {
                let h = pool.header_mut(r);
                if !h.is_fixed() {
                    h.make_white(white);
                }
            }
        }
    }

    #[inline]
    pub(crate) fn mark_value(&mut self, v: Value, pool: &mut ObjectPool) {
        if let Some(r) = v.gc_ref() {
            self.mark_object(r, pool);
        }
    }

    /// Whites become gray (or black for leaf objects) and enter a work list.
    pub(crate) fn mark_object(&mut self, r: GcRef, pool: &mut ObjectPool) {
        let header = pool.header_mut(r);
        if !header.is_white() {
            return;
        }
        match r {
            // Strings are leaves: straight to black.
            GcRef::Str(_) => {
                header.make_black();
                self.marked += header.size as isize;
            }
            _ => {
                header.make_gray();
                self.gray.push(r);
            }
        }
    }

    fn propagate_one(&mut self, pool: &mut ObjectPool) -> isize {
        let Some(r) = self.gray.pop() else {
            return 0;
        };
        let size = pool.header(r).size as isize;
        self.marked += size;
        self.traverse(r, pool);
        size.max(1)
    }

    fn traverse(&mut self, r: GcRef, pool: &mut ObjectPool) {
        match r {
            GcRef::Table(t) => self.traverse_table(t, pool),
            GcRef::Closure(c) => {
                pool.header_mut(GcRef::Closure(c)).make_black();
                // Split borrow: snapshot the reference lists first.
                enum Snap {
                    Script(Vec<crate::gc::pool::UpvalRef>, std::rc::Rc<crate::value::func::Proto>),
                    Host(Vec<Value>),
                }
                let snap = match pool.closure(c) {
                    Closure::Script(sc) => Snap::Script(sc.upvals.clone(), sc.proto.clone()),
                    Closure::Host(hc) => Snap::Host(hc.upvals.clone()),
                };
                match snap {
                    Snap::Script(upvals, proto) => {
                        for uv in upvals {
                            self.mark_object(GcRef::Upval(uv), pool);
                        }
                        self.mark_proto(&proto, pool);
                    }
                    Snap::Host(vals) => {
                        for v in vals {
                            self.mark_value(v, pool);
                        }
                    }
                }
            }
            GcRef::Upval(u) => {
                pool.header_mut(GcRef::Upval(u)).make_black();
                match *pool.upvalue(u) {
                    Upvalue::Open { thread, .. } => {
                        // The value lives in the thread's stack; keeping the
                        // thread alive keeps the slot alive.
                        self.mark_object(GcRef::Thread(thread), pool);
                    }
                    Upvalue::Closed(v) => self.mark_value(v, pool),
                }
            }
            GcRef::Thread(t) => self.traverse_thread(t, pool),
            GcRef::Userdata(u) => {
                pool.header_mut(GcRef::Userdata(u)).make_black();
                let (mt, uservalues) = {
                    let ud = pool.userdata_(u);
                    (ud.metatable, ud.uservalues.clone())
                };
                if let Some(mt) = mt {
                    self.mark_object(GcRef::Table(mt), pool);
                }
                for v in uservalues {
                    self.mark_value(v, pool);
                }
            }
            GcRef::Str(_) => {}
        }
    }

    /// Protos are plain shared data, not collectable, but their constants
    /// reference interned strings that must stay alive.
    fn mark_proto(&mut self, proto: &crate::value::func::Proto, pool: &mut ObjectPool) {
        for &k in &proto.constants {
            self.mark_value(k, pool);
        }
        for child in &proto.protos {
            self.mark_proto(child, pool);
        }
    }

    fn traverse_thread(&mut self, t: ThreadRef, pool: &mut ObjectPool) {
        // Threads are rescanned at the atomic step: their stacks mutate
        // constantly, so they never turn black during propagation.
        if self.state == GcState::Propagate {
            self.grayagain.push(GcRef::Thread(t));
            pool.header_mut(GcRef::Thread(t)).make_gray();
        } else {
            pool.header_mut(GcRef::Thread(t)).make_black();
        }
        let (stack, upvals, errval) = {
            let th = pool.thread(t);
            (
                th.live_stack().to_vec(),
                th.open_upvals.clone(),
                th.error_value,
            )
        };
        for v in stack {
            self.mark_value(v, pool);
        }
        for uv in upvals {
            self.mark_object(GcRef::Upval(uv), pool);
        }
        self.mark_value(errval, pool);
    }

    /// Weak mode of a table, read from its metatable's `__mode`.
    fn table_mode(&self, t: TableRef, pool: &ObjectPool) -> (bool, bool) {
        let Some(mt) = pool.table(t).metatable else {
            return (false, false);
        };
        let Some(key) = self.mode_key else {
            return (false, false);
        };
        match pool.table_rawget(mt, Value::Str(key)) {
            Value::Str(s) => {
                let bytes = pool.str_(s).as_bytes();
                (bytes.contains(&b'k'), bytes.contains(&b'v'))
            }
            _ => (false, false),
        }
    }

    fn traverse_table(&mut self, t: TableRef, pool: &mut ObjectPool) {
        let (weak_keys, weak_values) = self.table_mode(t, pool);
        if let Some(mt) = pool.table(t).metatable {
            self.mark_object(GcRef::Table(mt), pool);
        }
        let header = pool.header_mut(GcRef::Table(t));
        match (weak_keys, weak_values) {
            (false, false) => {
                header.make_black();
                self.traverse_strong_table(t, pool);
            }
            (false, true) => {
                // Weak values: keys are strong, values cleared later.
                header.make_black();
                let entries = pool.table(t).live_entries();
                for (k, _) in entries {
                    self.mark_value(k, pool);
                }
                self.weak.push(t);
            }
            (true, false) => {
                header.make_black();
                if self.traverse_ephemeron(t, pool) {
                    // Some entry is still undecided.
                    self.ephemeron.push(t);
                }
            }
            (true, true) => {
                header.make_black();
                self.allweak.push(t);
            }
        }
    }

    fn traverse_strong_table(&mut self, t: TableRef, pool: &mut ObjectPool) {
        // Keys of dead entries are marked too: they must outlive the entry
        // for chain and traversal integrity, and the next rehash drops them.
        let (array, node_pairs) = {
            let table = pool.table(t);
            let array: Vec<Value> = table.array.iter().flatten().copied().collect();
            let nodes: Vec<(Value, Value)> = table
                .nodes
                .iter()
                .filter(|n| !n.key.is_nil())
                .map(|n| (n.key, n.val))
                .collect();
            (array, nodes)
        };
        for v in array {
            self.mark_value(v, pool);
        }
        for (k, v) in node_pairs {
            self.mark_value(k, pool);
            self.mark_value(v, pool);
        }
    }

    /// Mark values whose keys are already reachable. Returns true when some
    /// entry still has a white key with an unmarked value (i.e. the table
    /// needs another convergence round).
    fn traverse_ephemeron(&mut self, t: TableRef, pool: &mut ObjectPool) -> bool {
        // Array entries have integer keys, which are always reachable.
        let array: Vec<Value> = pool.table(t).array.iter().flatten().copied().collect();
        for v in array {
            self.mark_value(v, pool);
        }
        let pairs: Vec<(Value, Value)> = pool
            .table(t)
            .nodes
            .iter()
            .filter(|n| !n.key.is_nil() && !n.val.is_nil())
            .map(|n| (n.key, n.val))
            .collect();
        let mut unresolved = false;
        for (k, v) in pairs {
            let key_white = k
                .gc_ref()
                .map(|r| pool.header(r).is_white())
                .unwrap_or(false);
            if key_white {
                let val_white = v
                    .gc_ref()
                    .map(|r| pool.header(r).is_white())
                    .unwrap_or(false);
                if val_white {
                    unresolved = true;
                }
            } else {
                self.mark_value(v, pool);
            }
        }
        unresolved
    }

    // ================= atomic =================

    fn atomic(&mut self, roots: &[Value], pool: &mut ObjectPool) -> isize {
        let mut work = 0isize;
        // Roots may have changed since the cycle started.
        for v in roots {
            self.mark_value(*v, pool);
        }
        work += self.propagate_all(pool);
        // Objects mutated behind the barrier, threads included.
        let grayagain = std::mem::take(&mut self.grayagain);
        for r in grayagain {
            work += 1;
            self.traverse(r, pool);
        }
        work += self.propagate_all(pool);
        self.converge_ephemerons(pool);
        // Values of weak tables that died this cycle.
        self.clear_by_values(&self.weak.clone(), pool);
        self.clear_by_values(&self.allweak.clone(), pool);
        // Resurrect unreachable finalizable objects into the queue.
        self.separate_tobefnz(pool);
        let tobefnz = self.tobefnz.clone();
        for r in tobefnz {
            self.mark_object(r, pool);
        }
        work += self.propagate_all(pool);
        self.converge_ephemerons(pool);
        // Keys died; their entries go, keys linger as tombstones.
        self.clear_by_keys(&self.ephemeron.clone(), pool);
        self.clear_by_keys(&self.allweak.clone(), pool);
        // A second value pass: finalizable separation marked new objects.
        self.clear_by_values(&self.weak.clone(), pool);
        self.clear_by_values(&self.allweak.clone(), pool);
        self.tombstone_dead_keys(pool);
        self.current_white ^= 1;
        work
    }

    /// Dead entries in weak tables may hold keys about to be swept; replace
    /// such keys with a tombstone (NaN: never equal to any lookup key and
    /// never insertable) so chains and traversal stay intact without
    /// keeping the object alive.
    fn tombstone_dead_keys(&self, pool: &mut ObjectPool) {
        let tables: Vec<TableRef> = self
            .weak
            .iter()
            .chain(self.ephemeron.iter())
            .chain(self.allweak.iter())
            .copied()
            .collect();
        for t in tables {
            let nlen = pool.table(t).nodes.len();
            for i in 0..nlen {
                let node = pool.table(t).nodes[i];
                if node.val.is_nil() && !node.key.is_nil() {
                    let dead = node
                        .key
                        .gc_ref()
                        .map(|r| pool.header(r).is_white())
                        .unwrap_or(false);
                    if dead {
                        pool.table_mut(t).nodes[i].key = Value::Float(f64::NAN);
                    }
                }
            }
        }
    }

    fn propagate_all(&mut self, pool: &mut ObjectPool) -> isize {
        let mut w = 0;
        while !self.gray.is_empty() {
            w += self.propagate_one(pool);
        }
        w
    }

    fn converge_ephemerons(&mut self, pool: &mut ObjectPool) {
        loop {
            let mut changed = false;
            let tables = self.ephemeron.clone();
            self.ephemeron.clear();
            for t in tables {
                let before = self.gray.len();
                let unresolved = self.traverse_ephemeron(t, pool);
                if self.gray.len() > before {
                    self.propagate_all(pool);
                    changed = true;
                }
                if unresolved {
                    self.ephemeron.push(t);
                }
            }
            if !changed {
                break;
            }
        }
    }

    fn clear_by_values(&self, tables: &[TableRef], pool: &mut ObjectPool) {
        for &t in tables {
            let asize = pool.table(t).array.len();
            for i in 0..asize {
                let dead = pool.table(t).array[i]
                    .and_then(|v| v.gc_ref())
                    .map(|r| pool.header(r).is_white())
                    .unwrap_or(false);
                if dead {
                    pool.table_mut(t).array[i] = None;
                }
            }
            let nlen = pool.table(t).nodes.len();
            for i in 0..nlen {
                let dead = pool.table(t).nodes[i]
                    .val
                    .gc_ref()
                    .map(|r| pool.header(r).is_white())
                    .unwrap_or(false);
                if dead {
                    pool.table_mut(t).nodes[i].val = Value::Nil;
                }
            }
        }
    }

    fn clear_by_keys(&self, tables: &[TableRef], pool: &mut ObjectPool) {
        for &t in tables {
            let nlen = pool.table(t).nodes.len();
            for i in 0..nlen {
                let node = pool.table(t).nodes[i];
                let key_dead = node
                    .key
                    .gc_ref()
                    .map(|r| pool.header(r).is_white())
                    .unwrap_or(false);
                if key_dead && !node.val.is_nil() {
                    pool.table_mut(t).nodes[i].val = Value::Nil;
                }
            }
        }
    }

    /// Move unreachable finalizable objects to the queue, newest first.
    fn separate_tobefnz(&mut self, pool: &mut ObjectPool) {
        let mut kept = Vec::with_capacity(self.finobj.len());
        for &r in &self.finobj {
            if pool.header(r).is_white() {
                self.tobefnz.push(r);
            } else {
                kept.push(r);
            }
        }
        self.finobj = kept;
    }

    // ================= sweeping =================

    /// Sweep a bounded number of entries of the current list, compacting in
    /// place so list order is preserved (the generational boundary depends
    /// on it). Returns (work, list finished).
    fn sweep_slice(&mut self, pool: &mut ObjectPool, budget: usize) -> (usize, bool) {
        let other_white = GcHeader::other_white(self.current_white);
        let current_white = self.current_white;
        let generational = self.kind == GcKind::GenMinor;
        let mut work = 0;
        // Borrow the list out to appease the borrow checker.
        let mut list = match self.state {
            GcState::SwpAllGc => std::mem::take(&mut self.allgc),
            GcState::SwpFinObj => std::mem::take(&mut self.finobj),
            _ => std::mem::take(&mut self.tobefnz),
        };
        while self.sweep_read < list.len() && work < budget {
            let r = list[self.sweep_read];
            self.sweep_read += 1;
            work += 1;
            let header = pool.header_mut(r);
            if !header.is_fixed() && header.is_dead(other_white) {
                let size = pool.free_object(r);
                self.account_free(size);
                self.stats.objects_collected += 1;
            } else {
                let header = pool.header_mut(r);
                header.make_white(current_white);
                if generational {
                    advance_age(header);
                }
                list[self.sweep_write] = r;
                self.sweep_write += 1;
            }
        }
        let complete = self.sweep_read >= list.len();
        if complete {
            list.truncate(self.sweep_write);
        }
        match self.state {
            GcState::SwpAllGc => self.allgc = list,
            GcState::SwpFinObj => self.finobj = list,
            _ => self.tobefnz = list,
        }
        (work, complete)
    }

    // ================= generational mode =================

    /// A minor collection: full mark (old objects are not traversed), sweep
    /// of the young tail of `allgc` only, with survivor aging.
    fn young_collection(&mut self, roots: &[Value], pool: &mut ObjectPool) {
        self.stats.minor_collections += 1;
        self.restart_collection(roots, pool);
        while !self.gray.is_empty() {
            self.propagate_one(pool);
        }
        let grayagain = std::mem::take(&mut self.grayagain);
        for r in grayagain {
            self.traverse(r, pool);
        }
        self.propagate_all(pool);
        self.converge_ephemerons(pool);
        self.clear_by_values(&self.weak.clone(), pool);
        self.clear_by_values(&self.allweak.clone(), pool);
        self.separate_tobefnz(pool);
        let tobefnz = self.tobefnz.clone();
        for r in tobefnz {
            self.mark_object(r, pool);
        }
        self.propagate_all(pool);
        self.clear_by_keys(&self.ephemeron.clone(), pool);
        self.clear_by_keys(&self.allweak.clone(), pool);
        self.tombstone_dead_keys(pool);
        self.current_white ^= 1;
        // Sweep only the young suffix.
        self.sweep_read = self.gen_boundary.min(self.allgc.len());
        self.sweep_write = self.sweep_read;
        let other_white = GcHeader::other_white(self.current_white);
        let current_white = self.current_white;
        let mut list = std::mem::take(&mut self.allgc);
        while self.sweep_read < list.len() {
            let r = list[self.sweep_read];
            self.sweep_read += 1;
            let header = pool.header_mut(r);
            if !header.is_fixed() && header.is_dead(other_white) {
                let size = pool.free_object(r);
                self.account_free(size);
                self.stats.objects_collected += 1;
            } else {
                let header = pool.header_mut(r);
                header.make_white(current_white);
                advance_age(header);
                list[self.sweep_write] = r;
                self.sweep_write += 1;
            }
        }
        list.truncate(self.sweep_write);
        self.allgc = list;
        self.gen_boundary = self.allgc.len();
        self.state = GcState::Pause;
        // Shift to major collections when the heap grew past the
        // minor-major threshold.
        let threshold = apply_param(self.params[PARAM_MINORMAJOR], self.marked.max(1));
        if threshold > 0 && self.total_bytes > threshold * 2 {
            self.kind = GcKind::GenMajor;
        }
    }

    // ================= barriers =================

    /// Forward barrier: black `owner` just acquired a reference to `v`.
    /// While marking, restore the invariant by marking `v` immediately; in
    /// generational mode an old owner makes `v` old-born.
    pub fn barrier_forward(&mut self, owner: GcRef, v: Value, pool: &mut ObjectPool) {
        let Some(vr) = v.gc_ref() else {
            return;
        };
        if !pool.header(owner).is_black() || !pool.header(vr).is_white() {
            return;
        }
        if self.state.keep_invariant() {
            self.mark_object(vr, pool);
            if pool.header(owner).is_old() {
                pool.header_mut(vr).set_age(AGE_OLD0);
            }
        } else if self.state.is_sweep() {
            // The sweep will repaint anyway; whiten the owner so repeated
            // writes stop triggering the barrier.
            if self.kind != GcKind::GenMinor {
                let white = self.current_white;
                pool.header_mut(owner).make_white(white);
            }
        } else if self.kind == GcKind::GenMinor && pool.header(owner).is_old() {
            pool.header_mut(vr).set_age(AGE_OLD0);
        }
    }

    /// Back barrier: black table mutated. Repaint it gray and queue it for
    /// the atomic rescan instead of marking every stored value.
    pub fn barrier_back(&mut self, t: TableRef, pool: &mut ObjectPool) {
        let r = GcRef::Table(t);
        let header = pool.header(r);
        let age = header.age();
        if self.kind == GcKind::GenMinor {
            if !header.is_old() {
                return;
            }
            if age == AGE_TOUCHED1 {
                return; // already queued this cycle
            }
        } else if !header.is_black() {
            return;
        }
        if age == AGE_TOUCHED2 {
            pool.header_mut(r).make_gray();
        } else {
            if !self.grayagain.contains(&r) {
                self.grayagain.push(r);
            }
            pool.header_mut(r).make_gray();
        }
        if age >= AGE_OLD0 {
            pool.header_mut(r).set_age(AGE_TOUCHED1);
        }
    }

    // ================= observation hooks for tests =================

    pub fn gray_contains(&self, r: GcRef) -> bool {
        self.gray.contains(&r) || self.grayagain.contains(&r)
    }

    pub fn state(&self) -> GcState {
        self.state
    }

    pub fn kind(&self) -> GcKind {
        self.kind
    }
}

/// Survivor aging after a minor sweep.
fn advance_age(header: &mut GcHeader) {
    let next = match header.age() {
        AGE_NEW => AGE_SURVIVAL,
        AGE_SURVIVAL => AGE_OLD1,
        AGE_OLD0 => AGE_OLD1,
        AGE_OLD1 => AGE_OLD,
        AGE_TOUCHED1 => AGE_TOUCHED2,
        AGE_TOUCHED2 => AGE_OLD,
        old => old,
    };
    header.set_age(next);
}
