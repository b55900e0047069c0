//! The LALR(k) generator: first sets, LR(0) automaton, LALR(1)
//! lookaheads, lookahead extension, error-recovery states, and the
//! flattened, bit-packed parse table.
//!
//! The classic background is the Dragon Book; lookahead extension
//! follows Charles' thesis, recovery follows Snyder's, and the table
//! flattening is the Tarjan-Yao displacement scheme.
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;

use ahash::{AHashMap, AHashSet};
use fixedbitset::FixedBitSet;
use strum::FromRepr;

use crate::errors::{ErrorHandler, ErrorType};
use crate::grammar::{Grammar, RuleId, SymbolId};
use crate::DebugFlags;

/// The kind of a parse action, in encoding order.
#[derive(Debug, FromRepr, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub(crate) enum ActionType {
    LaShift = 0,
    Shift = 1,
    Reduce = 2,
    Goto = 3,
    Restart = 4,
    Accept = 5,
    Error = 6,
}

/// An unencoded parse action. The derived ordering makes it usable as a
/// map key during conflict bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct ParseAction {
    pub action_type: ActionType,
    pub goto_state: i64,
    pub rule_num: i64,
    pub fallback_state: i64,
}

impl ParseAction {
    fn of(action_type: ActionType) -> ParseAction {
        ParseAction {
            action_type,
            goto_state: -1,
            rule_num: -1,
            fallback_state: -1,
        }
    }

    fn shift(goto_state: i64) -> ParseAction {
        ParseAction {
            goto_state,
            ..ParseAction::of(ActionType::Shift)
        }
    }

    fn goto(goto_state: i64) -> ParseAction {
        ParseAction {
            goto_state,
            ..ParseAction::of(ActionType::Goto)
        }
    }

    fn reduce(rule_num: i64) -> ParseAction {
        ParseAction {
            rule_num,
            ..ParseAction::of(ActionType::Reduce)
        }
    }
}

/// The flattened parse table: a checked-index / checked-data pair with
/// five bit fields packed into each row's words.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct LalrTables {
    pub start_state: i64,
    pub restart_state: i64,
    pub checked_index: Vec<i64>,
    pub checked_data: Vec<i64>,
    pub num_offsets: i64,
    pub symbol_num_offset: i64,
    pub symbol_num_shift: i64,
    pub symbol_num_mask: i64,
    pub action_type_offset: i64,
    pub action_type_shift: i64,
    pub action_type_mask: i64,
    pub rule_num_offset: i64,
    pub rule_num_shift: i64,
    pub rule_num_mask: i64,
    pub state_num_offset: i64,
    pub state_num_shift: i64,
    pub state_num_mask: i64,
    pub fallback_num_offset: i64,
    pub fallback_num_shift: i64,
    pub fallback_num_mask: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
struct ItemId(u32);

impl ItemId {
    fn index(self) -> usize {
        self.0 as usize
    }

    fn next(self) -> ItemId {
        ItemId(self.0 + 1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
struct StateId(u32);

impl StateId {
    fn index(self) -> usize {
        self.0 as usize
    }
}

/// An LR(0) item: a rule with a dot position. Items of one rule occupy
/// consecutive arena slots, so advancing the dot is an index increment.
#[derive(Debug)]
struct Item {
    rule: RuleId,
    dot: usize,
    /// First set of the rhs suffix from the dot on; contains ε when the
    /// suffix is nullable.
    first_set: FixedBitSet,
}

/// A node of the automaton: an LR(0) state, a lookahead state grafted
/// onto one, or a powerset recovery state.
#[derive(Debug, Default)]
struct State {
    num: usize,
    lr0_state: StateId,
    item_set: Vec<ItemId>,
    lr0_goto: BTreeMap<SymbolId, StateId>,
    lookback_one: BTreeSet<StateId>,
    lookback: AHashMap<usize, BTreeSet<StateId>>,
    lookaheads: BTreeMap<ItemId, FixedBitSet>,
    lhs_follow: AHashMap<SymbolId, FixedBitSet>,
    action_multimap: BTreeMap<SymbolId, BTreeSet<ParseAction>>,
    action_map: BTreeMap<SymbolId, ParseAction>,
    la_goto_map: BTreeMap<SymbolId, StateId>,
    la_symbol: Option<SymbolId>,
    after_shift: BTreeMap<SymbolId, BTreeSet<StateId>>,
    base_states: Vec<StateId>,
}

/// Run all generator phases. On success the grammar's symbols carry
/// their table numbers and the flattened tables are returned; on any
/// diagnostic the result is `None`.
pub(crate) fn generate_tables(
    gram: &mut Grammar,
    errh: &mut ErrorHandler,
    debug_flags: DebugFlags,
) -> Option<LalrTables> {
    let mut generator = LalrGenerator {
        gram,
        errh,
        debug_flags,
        first_sets: Vec::new(),
        items: Vec::new(),
        rule_first_item: Vec::new(),
        states: Vec::new(),
        start_state: StateId(0),
        restart_state: StateId(0),
        state_set_map: AHashMap::new(),
        visited: AHashSet::new(),
        conflict_states: BTreeSet::new(),
    };
    generator.generate()
}

struct LalrGenerator<'a> {
    gram: &'a mut Grammar,
    errh: &'a mut ErrorHandler,
    debug_flags: DebugFlags,
    first_sets: Vec<FixedBitSet>,
    items: Vec<Item>,
    rule_first_item: Vec<ItemId>,
    states: Vec<State>,
    start_state: StateId,
    restart_state: StateId,
    state_set_map: AHashMap<Vec<StateId>, StateId>,
    visited: AHashSet<(StateId, SymbolId)>,
    conflict_states: BTreeSet<StateId>,
}

impl LalrGenerator<'_> {
    fn generate(&mut self) -> Option<LalrTables> {
        self.find_first_sets();
        if self.debug_flags.has(DebugFlags::LALR) {
            log::debug!(target: "hoshi::lalr", "first sets:\n{}", self.dump_first_sets());
        }
        self.build_items();
        self.build_lr0_automaton();
        if self.debug_flags.has(DebugFlags::PROGRESS) {
            log::debug!(
                target: "hoshi::lalr",
                "LR(0) automaton built: {} states",
                self.states.len()
            );
        }
        self.find_lalr1_lookaheads();
        if self.debug_flags.has(DebugFlags::LALR) {
            log::debug!(target: "hoshi::lalr", "{}", self.dump_automaton("LALR(1) automaton"));
        }
        self.infinite_loop_check();
        if self.errh.error_count() > 0 {
            return None;
        }
        self.encode_actions();
        self.extend_lookaheads();
        if self.errh.error_count() > 0 {
            return None;
        }
        if self.gram.error_recovery {
            self.add_error_recovery();
        } else {
            // The engine still needs a restart slot to decode.
            self.restart_state = self.start_state;
        }
        if self.debug_flags.has(DebugFlags::LALR) {
            log::debug!(target: "hoshi::lalr", "{}", self.dump_automaton("LALR(k) automaton"));
        }
        if self.debug_flags.has(DebugFlags::ACTIONS) {
            log::debug!(target: "hoshi::lalr", "{}", self.dump_automaton("parse actions"));
        }
        let tables = self.flatten_tables();
        if self.errh.error_count() > 0 {
            return None;
        }
        Some(tables)
    }

    //
    //  Small copied-out accessors. These keep grammar borrows short so
    //  the fixpoint passes can mutate states freely.
    //

    fn num_symbols(&self) -> usize {
        self.gram.num_symbols()
    }

    fn terminal_set(&self) -> FixedBitSet {
        FixedBitSet::with_capacity(self.num_symbols())
    }

    fn epsilon(&self) -> SymbolId {
        self.gram.epsilon_symbol
    }

    fn rule_lhs(&self, rule: RuleId) -> SymbolId {
        self.gram.rules[rule.index()].lhs
    }

    fn rule_len(&self, rule: RuleId) -> usize {
        self.gram.rules[rule.index()].rhs.len()
    }

    fn rule_sym(&self, rule: RuleId, dot: usize) -> SymbolId {
        self.gram.rules[rule.index()].rhs[dot]
    }

    fn item_first_contains_epsilon(&self, item: ItemId) -> bool {
        self.items[item.index()]
            .first_set
            .contains(self.epsilon().index())
    }

    fn goto_of(&self, state: StateId, symbol: SymbolId) -> StateId {
        *self.states[state.index()]
            .lr0_goto
            .get(&symbol)
            .expect("missing goto transition")
    }

    //
    //  First sets
    //

    /// Three steps: find the nullable symbols by advancing a dot over
    /// nullable prefixes, build a propagation map, then run the first
    /// sets to a fixpoint.
    fn find_first_sets(&mut self) {
        let num_symbols = self.num_symbols();
        let mut nullable = FixedBitSet::with_capacity(num_symbols);
        let mut dots = vec![0usize; self.gram.rules.len()];
        let mut changed = true;
        while changed {
            changed = false;
            for (index, rule) in self.gram.rules.iter().enumerate() {
                while dots[index] < rule.rhs.len()
                    && nullable.contains(rule.rhs[dots[index]].index())
                {
                    dots[index] += 1;
                }
                if dots[index] >= rule.rhs.len() && !nullable.contains(rule.lhs.index()) {
                    nullable.insert(rule.lhs.index());
                    changed = true;
                }
            }
        }

        // All elements of the first set of a domain symbol flow to the
        // first set of each range symbol.
        let mut propagate_map: Vec<Vec<SymbolId>> = vec![Vec::new(); num_symbols];
        for rule in &self.gram.rules {
            for &symbol in &rule.rhs {
                propagate_map[symbol.index()].push(rule.lhs);
                if !nullable.contains(symbol.index()) {
                    break;
                }
            }
        }

        self.first_sets = vec![FixedBitSet::with_capacity(num_symbols); num_symbols];
        let mut workpile: Vec<SymbolId> = Vec::new();
        for id in self.gram.symbol_ids() {
            if self.gram.symbol(id).is_terminal {
                self.first_sets[id.index()].insert(id.index());
                workpile.push(id);
            }
        }
        while let Some(source) = workpile.pop() {
            for target in propagate_map[source.index()].clone() {
                if !self.first_sets[source.index()].is_subset(&self.first_sets[target.index()]) {
                    let source_set = self.first_sets[source.index()].clone();
                    self.first_sets[target.index()].union_with(&source_set);
                    workpile.push(target);
                }
            }
        }

        let epsilon = self.epsilon();
        for symbol in nullable.ones() {
            self.first_sets[symbol].insert(epsilon.index());
        }
    }

    //
    //  Items
    //

    /// One item per `(rule, dot)`, with suffix first sets filled right
    /// to left, collapsing ε contributions.
    fn build_items(&mut self) {
        let epsilon = self.epsilon();
        for rule_index in 0..self.gram.rules.len() {
            let rule = RuleId(rule_index as u32);
            let len = self.rule_len(rule);
            self.rule_first_item.push(ItemId(self.items.len() as u32));
            for dot in 0..=len {
                self.items.push(Item {
                    rule,
                    dot,
                    first_set: self.terminal_set(),
                });
            }
            let last = self.items.len() - 1;
            self.items[last].first_set.insert(epsilon.index());
            for dot in (0..len).rev() {
                let index = last - len + dot;
                let mut first = self.first_sets[self.rule_sym(rule, dot).index()].clone();
                if first.contains(epsilon.index()) {
                    first.set(epsilon.index(), false);
                    let next = self.items[index + 1].first_set.clone();
                    first.union_with(&next);
                }
                self.items[index].first_set = first;
            }
        }
    }

    fn item_is_final(&self, item: ItemId) -> bool {
        let it = &self.items[item.index()];
        it.dot == self.rule_len(it.rule)
    }

    //
    //  LR(0) automaton
    //

    fn new_state(&mut self) -> StateId {
        let id = StateId(self.states.len() as u32);
        self.states.push(State {
            num: self.states.len(),
            lr0_state: id,
            ..State::default()
        });
        id
    }

    /// Per-nonterminal closure item sets, so closing a kernel is a
    /// union of precomputed sets.
    fn build_closure_items(&self) -> AHashMap<SymbolId, BTreeSet<ItemId>> {
        let mut closure_items: AHashMap<SymbolId, BTreeSet<ItemId>> = AHashMap::new();
        let mut propagate_map: AHashMap<SymbolId, BTreeSet<SymbolId>> = AHashMap::new();
        for (index, rule) in self.gram.rules.iter().enumerate() {
            closure_items
                .entry(rule.lhs)
                .or_default()
                .insert(self.rule_first_item[index]);
            if let Some(&first) = rule.rhs.first() {
                propagate_map.entry(first).or_default().insert(rule.lhs);
            }
        }
        let mut workpile: Vec<SymbolId> = self
            .gram
            .symbol_ids()
            .filter(|&id| self.gram.symbol(id).is_nonterminal)
            .collect();
        while let Some(symbol) = workpile.pop() {
            let items = closure_items.get(&symbol).cloned().unwrap_or_default();
            for target in propagate_map.get(&symbol).cloned().unwrap_or_default() {
                let target_items = closure_items.entry(target).or_default();
                let before = target_items.len();
                target_items.extend(items.iter().copied());
                if target_items.len() > before {
                    workpile.push(target);
                }
            }
        }
        closure_items
    }

    fn build_lr0_automaton(&mut self) {
        let closure_items = self.build_closure_items();

        let close = |items: &mut BTreeSet<ItemId>, this: &Self| {
            let kernel: Vec<ItemId> = items.iter().copied().collect();
            for item in kernel {
                if this.item_is_final(item) {
                    continue;
                }
                let it = &this.items[item.index()];
                let symbol = this.rule_sym(it.rule, it.dot);
                if let Some(extra) = closure_items.get(&symbol) {
                    items.extend(extra.iter().copied());
                }
            }
        };

        let mut state_map: AHashMap<Vec<ItemId>, StateId> = AHashMap::new();
        let start = self.new_state();
        self.start_state = start;
        let mut start_items: BTreeSet<ItemId> = BTreeSet::new();
        start_items.insert(self.rule_first_item[0]);
        close(&mut start_items, self);
        self.states[start.index()].item_set = start_items.iter().copied().collect();
        state_map.insert(self.states[start.index()].item_set.clone(), start);

        let mut index = 0;
        while index < self.states.len() {
            let state = StateId(index as u32);
            let mut goto_kernels: BTreeMap<SymbolId, BTreeSet<ItemId>> = BTreeMap::new();
            for &item in &self.states[index].item_set {
                if self.item_is_final(item) {
                    continue;
                }
                let it = &self.items[item.index()];
                goto_kernels
                    .entry(self.rule_sym(it.rule, it.dot))
                    .or_default()
                    .insert(item.next());
            }
            for (symbol, mut kernel) in goto_kernels {
                close(&mut kernel, self);
                let canonical: Vec<ItemId> = kernel.iter().copied().collect();
                let goto_state = match state_map.get(&canonical) {
                    Some(&existing) => existing,
                    None => {
                        let created = self.new_state();
                        self.states[created.index()].item_set = canonical.clone();
                        state_map.insert(canonical, created);
                        created
                    }
                };
                self.states[index].lr0_goto.insert(symbol, goto_state);
                self.states[goto_state.index()].lookback_one.insert(state);
            }
            index += 1;
        }
    }

    //
    //  Lazy lookback and lhs-follow
    //

    /// States reachable by backing up `distance` goto steps. Computed
    /// lazily; earlier results are kept and trusted.
    fn compute_lookback(&mut self, state: StateId, distance: usize) {
        if self.states[state.index()].lookback.contains_key(&distance) {
            return;
        }
        let mut propagate_map: AHashMap<(StateId, usize), BTreeSet<(StateId, usize)>> =
            AHashMap::new();
        let mut discovered: AHashSet<(StateId, usize)> = AHashSet::new();
        let mut workpile = vec![(state, distance)];
        discovered.insert((state, distance));
        while let Some((s, d)) = workpile.pop() {
            if d == 0 {
                self.states[s.index()]
                    .lookback
                    .entry(0)
                    .or_default()
                    .insert(s);
                continue;
            }
            for p in self.states[s.index()].lookback_one.clone() {
                propagate_map
                    .entry((p, d - 1))
                    .or_default()
                    .insert((s, d));
                if !self.states[p.index()].lookback.contains_key(&(d - 1))
                    && discovered.insert((p, d - 1))
                {
                    workpile.push((p, d - 1));
                }
            }
        }

        let mut workpile: Vec<(StateId, usize)> = propagate_map.keys().copied().collect();
        while let Some(source) = workpile.pop() {
            let Some(targets) = propagate_map.get(&source) else {
                continue;
            };
            let source_set = self.states[source.0.index()]
                .lookback
                .get(&source.1)
                .cloned()
                .unwrap_or_default();
            for &target in targets.clone().iter() {
                let target_set = self.states[target.0.index()]
                    .lookback
                    .entry(target.1)
                    .or_default();
                let before = target_set.len();
                target_set.extend(source_set.iter().copied());
                if target_set.len() > before {
                    workpile.push(target);
                }
            }
        }
        // Make sure the entry exists even when nothing reached it.
        self.states[state.index()].lookback.entry(distance).or_default();
    }

    /// Terminals that can follow a reduction to `lhs` in `state`.
    fn compute_lhs_follow(&mut self, state: StateId, lhs: SymbolId) {
        if self.states[state.index()].lhs_follow.contains_key(&lhs) {
            return;
        }
        let accept = self.gram.accept_symbol;
        let eof = self.gram.eof_symbol;
        let epsilon = self.epsilon();
        let num_symbols = self.num_symbols();

        let mut propagate_map: AHashMap<(StateId, SymbolId), BTreeSet<(StateId, SymbolId)>> =
            AHashMap::new();
        let mut discovered: AHashSet<(StateId, SymbolId)> = AHashSet::new();
        let mut workpile = vec![(state, lhs)];
        discovered.insert((state, lhs));
        while let Some((s, symbol)) = workpile.pop() {
            if symbol == accept {
                let set = self.states[s.index()]
                    .lhs_follow
                    .entry(symbol)
                    .or_insert_with(|| FixedBitSet::with_capacity(num_symbols));
                set.insert(eof.index());
                continue;
            }
            let goto_state = self.goto_of(s, symbol);
            let goto_items = self.states[goto_state.index()].item_set.clone();
            for item in goto_items {
                let (dot, rule) = {
                    let it = &self.items[item.index()];
                    (it.dot, it.rule)
                };
                if dot == 0 {
                    continue;
                }
                let first = self.items[item.index()].first_set.clone();
                let num_symbols = self.num_symbols();
                let direct = self.states[s.index()]
                    .lhs_follow
                    .entry(symbol)
                    .or_insert_with(|| FixedBitSet::with_capacity(num_symbols));
                let mut saw_epsilon = false;
                for terminal in first.ones() {
                    if terminal == epsilon.index() {
                        saw_epsilon = true;
                    } else {
                        direct.insert(terminal);
                    }
                }
                if saw_epsilon {
                    let rule_lhs = self.rule_lhs(rule);
                    self.compute_lookback(s, dot - 1);
                    for p in self.states[s.index()].lookback[&(dot - 1)].clone() {
                        propagate_map
                            .entry((p, rule_lhs))
                            .or_default()
                            .insert((s, symbol));
                        if !self.states[p.index()].lhs_follow.contains_key(&rule_lhs)
                            && discovered.insert((p, rule_lhs))
                        {
                            workpile.push((p, rule_lhs));
                        }
                    }
                }
            }
        }

        let mut workpile: Vec<(StateId, SymbolId)> = propagate_map.keys().copied().collect();
        while let Some(source) = workpile.pop() {
            let Some(targets) = propagate_map.get(&source).cloned() else {
                continue;
            };
            let source_set = self.states[source.0.index()]
                .lhs_follow
                .get(&source.1)
                .cloned()
                .unwrap_or_else(|| FixedBitSet::with_capacity(self.gram.num_symbols()));
            for target in targets {
                let num_symbols = self.num_symbols();
                let target_set = self.states[target.0.index()]
                    .lhs_follow
                    .entry(target.1)
                    .or_insert_with(|| FixedBitSet::with_capacity(num_symbols));
                if !source_set.is_subset(target_set) {
                    target_set.union_with(&source_set);
                    workpile.push(target);
                }
            }
        }
        let num_symbols = self.num_symbols();
        self.states[state.index()]
            .lhs_follow
            .entry(lhs)
            .or_insert_with(|| FixedBitSet::with_capacity(num_symbols));
    }

    //
    //  LALR(1) lookaheads
    //

    /// Walk an item to its rule's end, following gotos from `state`.
    fn walk_to_end(&self, mut state: StateId, mut item: ItemId) -> (StateId, ItemId) {
        while !self.item_is_final(item) {
            let it = &self.items[item.index()];
            let symbol = self.rule_sym(it.rule, it.dot);
            state = self.goto_of(state, symbol);
            item = item.next();
        }
        (state, item)
    }

    /// One-pass seeding plus fixpoint propagation, applying item first
    /// sets to the symbol before the dot.
    fn find_lalr1_lookaheads(&mut self) {
        let epsilon = self.epsilon();
        let eof = self.gram.eof_symbol;
        let num_symbols = self.num_symbols();

        let mut propagate_map: AHashMap<(StateId, ItemId), BTreeSet<(StateId, ItemId)>> =
            AHashMap::new();
        let mut workpile: BTreeSet<(StateId, ItemId)> = BTreeSet::new();

        let (accept_state, accept_item) =
            self.walk_to_end(self.start_state, self.rule_first_item[0]);
        self.states[accept_state.index()]
            .lookaheads
            .entry(accept_item)
            .or_insert_with(|| FixedBitSet::with_capacity(num_symbols))
            .insert(eof.index());
        workpile.insert((accept_state, accept_item));

        for source_base_index in 0..self.states.len() {
            let source_base = StateId(source_base_index as u32);
            let base_items = self.states[source_base_index].item_set.clone();
            for &source_base_item in &base_items {
                let (dot, rule) = {
                    let it = &self.items[source_base_item.index()];
                    (it.dot, it.rule)
                };
                if dot == 0 {
                    continue;
                }
                let source_symbol = self.rule_sym(rule, dot - 1);
                let (source_state, source_item) = self.walk_to_end(source_base, source_base_item);
                let first = self.items[source_base_item.index()].first_set.clone();

                for target_base in self.states[source_base_index].lookback_one.clone() {
                    let target_items = self.states[target_base.index()].item_set.clone();
                    for target_base_item in target_items {
                        if self.rule_lhs(self.items[target_base_item.index()].rule)
                            != source_symbol
                        {
                            continue;
                        }
                        let (target_state, target_item) =
                            self.walk_to_end(target_base, target_base_item);
                        for symbol in first.ones() {
                            if symbol == epsilon.index() {
                                propagate_map
                                    .entry((source_state, source_item))
                                    .or_default()
                                    .insert((target_state, target_item));
                            } else {
                                self.states[target_state.index()]
                                    .lookaheads
                                    .entry(target_item)
                                    .or_insert_with(|| FixedBitSet::with_capacity(num_symbols))
                                    .insert(symbol);
                            }
                            workpile.insert((target_state, target_item));
                        }
                    }
                }
            }
        }

        let mut workpile: Vec<(StateId, ItemId)> = workpile.into_iter().collect();
        while let Some(source) = workpile.pop() {
            let Some(targets) = propagate_map.get(&source).cloned() else {
                continue;
            };
            let source_set = self.states[source.0.index()]
                .lookaheads
                .get(&source.1)
                .cloned()
                .unwrap_or_else(|| FixedBitSet::with_capacity(num_symbols));
            for target in targets {
                let target_set = self.states[target.0.index()]
                    .lookaheads
                    .entry(target.1)
                    .or_insert_with(|| FixedBitSet::with_capacity(num_symbols));
                if !source_set.is_subset(target_set) {
                    target_set.union_with(&source_set);
                    workpile.push(target);
                }
            }
        }
    }

    //
    //  Preliminary action encoding
    //

    /// Transitions become shifts and gotos, completed items become
    /// accepts or reduces. Conflicts stay as multi-action sets for the
    /// extension phase.
    fn encode_actions(&mut self) {
        let accept = self.gram.accept_symbol;
        for index in 0..self.states.len() {
            let gotos = self.states[index].lr0_goto.clone();
            for (symbol, goto_state) in gotos {
                let action = if self.gram.symbol(symbol).is_terminal {
                    ParseAction::shift(goto_state.index() as i64)
                } else if self.gram.symbol(symbol).is_nonterminal {
                    ParseAction::goto(goto_state.index() as i64)
                } else {
                    continue;
                };
                self.states[index]
                    .action_multimap
                    .entry(symbol)
                    .or_default()
                    .insert(action);
            }
            let lookaheads = self.states[index].lookaheads.clone();
            for (item, symbols) in lookaheads {
                let rule = self.items[item.index()].rule;
                let action = if self.rule_lhs(rule) == accept {
                    ParseAction::of(ActionType::Accept)
                } else {
                    ParseAction::reduce(rule.index() as i64)
                };
                for symbol in symbols.ones() {
                    self.states[index]
                        .action_multimap
                        .entry(SymbolId(symbol as u32))
                        .or_default()
                        .insert(action);
                }
            }
        }
    }

    //
    //  Hard-fail checks before lookahead extension
    //

    /// Either of these conditions would make the extension below loop
    /// forever, so they are fatal.
    fn infinite_loop_check(&mut self) {
        if self.gram.max_lookaheads < 2 {
            return;
        }
        self.check_reads_cycle();
        self.check_rm_produce();
    }

    /// A cycle of gotos whose symbols are all nullable.
    fn check_reads_cycle(&mut self) {
        let epsilon = self.epsilon();
        let mut edges: Vec<Vec<usize>> = vec![Vec::new(); self.states.len()];
        for (index, state) in self.states.iter().enumerate() {
            for (&symbol, &target) in &state.lr0_goto {
                if self.first_sets[symbol.index()].contains(epsilon.index()) {
                    edges[index].push(target.index());
                }
            }
        }

        // Iterative coloring walk; 1 = on the path, 2 = finished.
        let mut color = vec![0u8; self.states.len()];
        let mut cycle: Vec<usize> = Vec::new();
        'outer: for root in 0..self.states.len() {
            if color[root] != 0 {
                continue;
            }
            let mut stack: Vec<(usize, usize)> = vec![(root, 0)];
            color[root] = 1;
            while let Some(&(node, edge)) = stack.last() {
                if edge < edges[node].len() {
                    stack.last_mut().unwrap().1 += 1;
                    let target = edges[node][edge];
                    match color[target] {
                        0 => {
                            color[target] = 1;
                            stack.push((target, 0));
                        }
                        1 => {
                            let start = stack.iter().position(|&(n, _)| n == target).unwrap();
                            cycle = stack[start..].iter().map(|&(n, _)| n).collect();
                            break 'outer;
                        }
                        _ => {}
                    }
                } else {
                    color[node] = 2;
                    stack.pop();
                }
            }
        }

        if cycle.is_empty() {
            return;
        }
        let mut short_message = String::from("Cycle in the READS relation\n\n    ");
        for (position, state) in cycle.iter().enumerate() {
            if position > 0 {
                short_message.push_str(" -> ");
            }
            let _ = write!(short_message, "{state}");
        }
        let mut long_message = short_message.clone();
        long_message.push('\n');
        for &state in &cycle {
            long_message.push_str(&self.dump_state(StateId(state as u32)));
        }
        self.errh
            .add_error_long(ErrorType::ReadsCycle, -1, &short_message, &long_message);
    }

    /// A nonterminal that can rightmost-produce itself.
    fn check_rm_produce(&mut self) {
        let epsilon = self.epsilon();
        let mut propagate_map: AHashMap<SymbolId, BTreeSet<SymbolId>> = AHashMap::new();
        for (index, rule) in self.gram.rules.iter().enumerate() {
            if rule.rhs.is_empty() {
                continue;
            }
            let after_first = self.rule_first_item[index].next();
            if self.items[after_first.index()]
                .first_set
                .contains(epsilon.index())
            {
                propagate_map
                    .entry(rule.rhs[0])
                    .or_default()
                    .insert(rule.lhs);
            }
        }

        let mut produce: AHashMap<SymbolId, BTreeSet<SymbolId>> = AHashMap::new();
        for (&left, rights) in &propagate_map {
            for &right in rights {
                produce.entry(right).or_default().insert(left);
            }
        }
        let mut workpile: Vec<SymbolId> = propagate_map.keys().copied().collect();
        while let Some(left) = workpile.pop() {
            let sources = produce.get(&left).cloned().unwrap_or_default();
            for right in propagate_map.get(&left).cloned().unwrap_or_default() {
                let target = produce.entry(right).or_default();
                let before = target.len();
                target.extend(sources.iter().copied());
                if target.len() > before {
                    workpile.push(right);
                }
            }
        }

        let mut bad_names: Vec<String> = produce
            .iter()
            .filter(|&(symbol, set)| set.contains(symbol))
            .map(|(&symbol, _)| self.gram.symbol_name(symbol).to_string())
            .collect();
        if bad_names.is_empty() {
            return;
        }
        bad_names.sort();
        self.errh.add_error(
            ErrorType::SymbolSelfProduce,
            -1,
            &format!(
                "The following symbols can produce themselves: {}",
                bad_names.join(", ")
            ),
        );
    }

    //
    //  LALR(k) lookahead extension
    //

    /// The terminals readable after consuming `symbol` from the state
    /// configuration in `stack`.
    fn next_la(&mut self, stack: &[StateId], symbol: SymbolId) -> FixedBitSet {
        let state = *stack.last().unwrap();
        let mut la = self.terminal_set();
        let goto_state = self.goto_of(state, symbol);
        for &item in self.states[goto_state.index()].item_set.clone().iter() {
            let first = self.items[item.index()].first_set.clone();
            la.union_with(&first);
        }

        let accept = self.gram.accept_symbol;
        let state_items = self.states[state.index()].item_set.clone();
        for item in state_items {
            let (dot, rule) = {
                let it = &self.items[item.index()];
                (it.dot, it.rule)
            };
            if dot >= self.rule_len(rule)
                || self.rule_sym(rule, dot) != symbol
                || !self.item_first_contains_epsilon(item.next())
                || self.rule_lhs(rule) == accept
            {
                continue;
            }
            let lhs = self.rule_lhs(rule);
            if dot < stack.len() {
                let next_stack = stack[..stack.len() - dot].to_vec();
                let nested = self.next_la(&next_stack, lhs);
                la.union_with(&nested);
            } else {
                let distance = dot + 1 - stack.len();
                self.compute_lookback(stack[0], distance);
                for q in self.states[stack[0].index()].lookback[&distance].clone() {
                    self.compute_lhs_follow(q, lhs);
                    let follow = self.states[q.index()].lhs_follow[&lhs].clone();
                    la.union_with(&follow);
                }
            }
        }
        la.set(self.epsilon().index(), false);
        la
    }

    /// Configurations that can follow `stack` after a transition on
    /// `symbol`, any number of reductions, and a shift of `terminal`.
    fn follow_sources(
        &mut self,
        stack: &[StateId],
        symbol: SymbolId,
        terminal: SymbolId,
    ) -> BTreeSet<Vec<StateId>> {
        let state = *stack.last().unwrap();
        if stack.len() == 1 && !self.visited.insert((state, symbol)) {
            return BTreeSet::new();
        }

        let mut stack_set = BTreeSet::new();
        let goto_state = self.goto_of(state, symbol);

        if self.states[goto_state.index()].lr0_goto.contains_key(&terminal) {
            let mut next_stack = stack.to_vec();
            next_stack.push(goto_state);
            stack_set.insert(next_stack);
        }

        let epsilon = self.epsilon();
        let nullable_reads: Vec<SymbolId> = self.states[goto_state.index()]
            .lr0_goto
            .keys()
            .copied()
            .filter(|s| self.first_sets[s.index()].contains(epsilon.index()))
            .collect();
        for read_symbol in nullable_reads {
            let mut next_stack = stack.to_vec();
            next_stack.push(goto_state);
            stack_set.extend(self.follow_sources(&next_stack, read_symbol, terminal));
        }

        let accept = self.gram.accept_symbol;
        let state_items = self.states[state.index()].item_set.clone();
        for item in state_items {
            let (dot, rule) = {
                let it = &self.items[item.index()];
                (it.dot, it.rule)
            };
            let len = self.rule_len(rule);
            if len == 0 || dot != len - 1 {
                continue;
            }
            if self.rule_sym(rule, dot) != symbol || self.rule_lhs(rule) == accept {
                continue;
            }
            let lhs = self.rule_lhs(rule);
            if dot < stack.len() {
                let next_stack = stack[..stack.len() - dot].to_vec();
                stack_set.extend(self.follow_sources(&next_stack, lhs, terminal));
            } else {
                let distance = dot + 1 - stack.len();
                self.compute_lookback(stack[0], distance);
                for q in self.states[stack[0].index()].lookback[&distance].clone() {
                    stack_set.extend(self.follow_sources(&[q], lhs, terminal));
                }
            }
        }
        stack_set
    }

    /// Graft a lookahead state onto the automaton and recurse while the
    /// partitions still disagree, up to the lookahead bound.
    fn resolve_conflicts(
        &mut self,
        state: StateId,
        terminal: SymbolId,
        sources: &BTreeMap<ParseAction, BTreeSet<Vec<StateId>>>,
        lookahead: usize,
    ) {
        if lookahead > self.gram.max_lookaheads {
            let lr0 = self.states[state.index()].lr0_state;
            self.conflict_states.insert(lr0);
            return;
        }

        let la_state = self.new_state();
        self.states[la_state.index()].lookback_one.insert(state);
        self.states[la_state.index()].lr0_state = self.states[state.index()].lr0_state;
        self.states[state.index()]
            .la_goto_map
            .insert(terminal, la_state);
        self.states[la_state.index()].la_symbol = Some(terminal);

        for (action, stacks) in sources {
            for stack in stacks.clone() {
                let la = self.next_la(&stack, terminal);
                for symbol in la.ones() {
                    self.states[la_state.index()]
                        .action_multimap
                        .entry(SymbolId(symbol as u32))
                        .or_default()
                        .insert(*action);
                }
            }
        }

        let multimap = self.states[la_state.index()].action_multimap.clone();
        for (symbol, actions) in multimap {
            if actions.len() < 2 {
                continue;
            }
            let mut new_sources: BTreeMap<ParseAction, BTreeSet<Vec<StateId>>> = BTreeMap::new();
            for action in actions {
                for stack in sources.get(&action).cloned().unwrap_or_default() {
                    self.visited.clear();
                    new_sources
                        .entry(action)
                        .or_default()
                        .extend(self.follow_sources(&stack, terminal, symbol));
                }
            }
            self.resolve_conflicts(la_state, symbol, &new_sources, lookahead + 1);
        }
    }

    fn extend_lookaheads(&mut self) {
        let mut index = 0;
        while index < self.states.len() {
            let state = StateId(index as u32);
            index += 1;
            if self.states[state.index()].lr0_state != state {
                continue;
            }
            let multimap = self.states[state.index()].action_multimap.clone();
            for (symbol, actions) in multimap {
                if actions.len() < 2 {
                    continue;
                }
                let mut sources: BTreeMap<ParseAction, BTreeSet<Vec<StateId>>> = BTreeMap::new();
                for action in actions {
                    match action.action_type {
                        ActionType::Shift => {
                            sources.entry(action).or_default().insert(vec![state]);
                        }
                        ActionType::Reduce => {
                            let rule = RuleId(action.rule_num as u32);
                            let distance = self.rule_len(rule);
                            let lhs = self.rule_lhs(rule);
                            self.compute_lookback(state, distance);
                            for p in self.states[state.index()].lookback[&distance].clone() {
                                self.visited.clear();
                                let found = self.follow_sources(&[p], lhs, symbol);
                                sources.entry(action).or_default().extend(found);
                            }
                        }
                        _ => {}
                    }
                }
                self.resolve_conflicts(state, symbol, &sources, 2);
            }
        }

        if self.conflict_states.len() > self.gram.expected_conflicts {
            let mut short_message = String::from("The following states had conflicts: ");
            let names: Vec<String> = self
                .conflict_states
                .iter()
                .map(|s| s.index().to_string())
                .collect();
            short_message.push_str(&names.join(", "));
            let mut long_message = short_message.clone();
            long_message.push('\n');
            for &state in self.conflict_states.clone().iter() {
                long_message.push_str(&self.dump_state(state));
            }
            self.errh
                .add_error_long(ErrorType::LalrConflict, -1, &short_message, &long_message);
            return;
        }

        // Resolved conflicts become LaShift actions now; they were kept
        // aside so the extension could still see the originals.
        for index in 0..self.states.len() {
            let la_gotos = self.states[index].la_goto_map.clone();
            for (symbol, la_state) in la_gotos {
                let mut action = ParseAction::of(ActionType::LaShift);
                action.goto_state = la_state.index() as i64;
                let mut set = BTreeSet::new();
                set.insert(action);
                self.states[index].action_multimap.insert(symbol, set);
            }
        }

        // Conflicts within the expected budget break as shift, then
        // accept, then the lowest-numbered reduce.
        for state in self.conflict_states.clone() {
            let symbols: Vec<SymbolId> = self.gram.symbol_ids().collect();
            for symbol in symbols {
                let Some(actions) = self.states[state.index()].action_multimap.get(&symbol) else {
                    continue;
                };
                if actions.len() < 2 {
                    continue;
                }
                let mut chosen = ParseAction::of(ActionType::Error);
                let mut best_rule = i64::MAX;
                for action in actions {
                    if action.action_type == ActionType::Reduce && action.rule_num < best_rule {
                        chosen = *action;
                        best_rule = action.rule_num;
                    }
                }
                for action in actions {
                    if action.action_type == ActionType::Accept {
                        chosen = *action;
                    }
                }
                for action in actions {
                    if action.action_type == ActionType::Shift {
                        chosen = *action;
                    }
                }
                let mut set = BTreeSet::new();
                set.insert(chosen);
                self.states[state.index()].action_multimap.insert(symbol, set);
            }
        }

        for state in &mut self.states {
            for (&symbol, actions) in &state.action_multimap {
                state
                    .action_map
                    .insert(symbol, *actions.iter().next().unwrap());
            }
            state.action_multimap.clear();
        }
    }

    //
    //  Error-recovery states
    //

    /// States we might be in after shifting the current token, used to
    /// restart a reduce that would underflow the stack.
    fn find_after_shift(&mut self) {
        let mut propagate_map: AHashMap<(StateId, SymbolId), BTreeSet<(StateId, SymbolId)>> =
            AHashMap::new();

        for index in 0..self.states.len() {
            let state = StateId(index as u32);
            let action_map = self.states[index].action_map.clone();
            let is_la_state = self.states[index].lr0_state != state;
            let la_link = if is_la_state {
                let predecessor = *self.states[index].lookback_one.iter().next().unwrap();
                let la_symbol = self.states[index].la_symbol.unwrap();
                Some((predecessor, la_symbol))
            } else {
                None
            };
            for (symbol, action) in action_map {
                match action.action_type {
                    ActionType::LaShift => {
                        if let Some(link) = la_link {
                            propagate_map.entry((state, symbol)).or_default().insert(link);
                        }
                    }
                    ActionType::Shift => {
                        let goto_state = StateId(action.goto_state as u32);
                        self.states[index]
                            .after_shift
                            .entry(symbol)
                            .or_default()
                            .insert(goto_state);
                        if let Some(link) = la_link {
                            propagate_map.entry((state, symbol)).or_default().insert(link);
                        }
                    }
                    ActionType::Reduce => {
                        let rule = RuleId(action.rule_num as u32);
                        // The terminal as seen from the LR(0) origin of
                        // this lookahead chain.
                        let mut la_symbol = symbol;
                        let mut s = state;
                        while self.states[s.index()].lr0_state != s {
                            la_symbol = self.states[s.index()].la_symbol.unwrap();
                            s = *self.states[s.index()].lookback_one.iter().next().unwrap();
                        }
                        let lr0 = self.states[index].lr0_state;
                        let distance = self.rule_len(rule);
                        let lhs = self.rule_lhs(rule);
                        self.compute_lookback(lr0, distance);
                        for p in self.states[lr0.index()].lookback[&distance].clone() {
                            let goto_action = self.states[p.index()].action_map[&lhs];
                            let goto_state = StateId(goto_action.goto_state as u32);
                            propagate_map
                                .entry((goto_state, la_symbol))
                                .or_default()
                                .insert((state, symbol));
                            if let Some(link) = la_link {
                                propagate_map
                                    .entry((state, symbol))
                                    .or_default()
                                    .insert(link);
                            }
                        }
                    }
                    _ => {}
                }
            }
        }

        let mut workpile: Vec<(StateId, SymbolId)> = propagate_map.keys().copied().collect();
        while let Some(source) = workpile.pop() {
            let Some(targets) = propagate_map.get(&source).cloned() else {
                continue;
            };
            let source_set = self.states[source.0.index()]
                .after_shift
                .get(&source.1)
                .cloned()
                .unwrap_or_default();
            for target in targets {
                let target_set = self.states[target.0.index()]
                    .after_shift
                    .entry(target.1)
                    .or_default();
                let before = target_set.len();
                target_set.extend(source_set.iter().copied());
                if target_set.len() > before {
                    workpile.push(target);
                }
            }
        }
    }

    fn intern_state_set(&mut self, base_states: Vec<StateId>) -> StateId {
        if let Some(&existing) = self.state_set_map.get(&base_states) {
            return existing;
        }
        let state = self.new_state();
        self.states[state.index()].base_states = base_states.clone();
        self.state_set_map.insert(base_states, state);
        state
    }

    fn add_error_recovery(&mut self) {
        self.find_after_shift();

        // Singleton powersets fold back into the normal automaton.
        for index in 0..self.states.len() {
            let state = StateId(index as u32);
            self.states[index].base_states = vec![state];
            self.state_set_map.insert(vec![state], state);
        }

        let restart = self.new_state();
        self.restart_state = restart;
        let lr0_states: Vec<StateId> = (0..restart.index())
            .map(|n| StateId(n as u32))
            .filter(|&s| self.states[s.index()].lr0_state == s)
            .collect();
        self.states[restart.index()].base_states = lr0_states.clone();
        self.state_set_map.insert(lr0_states, restart);

        // Attach a fallback powerset to every reduce action.
        let eof = self.gram.eof_symbol;
        let attach_limit = restart.index();
        for index in 0..attach_limit {
            let domain: Vec<SymbolId> = self.states[index].action_map.keys().copied().collect();
            for symbol in domain {
                let action = self.states[index].action_map[&symbol];
                if action.action_type != ActionType::Reduce {
                    continue;
                }
                let fallback = if symbol == eof {
                    self.restart_state
                } else {
                    let base: Vec<StateId> = self.states[index]
                        .after_shift
                        .get(&symbol)
                        .map(|set| set.iter().copied().collect())
                        .unwrap_or_default();
                    self.intern_state_set(base)
                };
                let mut action = action;
                action.fallback_state = fallback.index() as i64;
                self.states[index].action_map.insert(symbol, action);
            }
        }

        self.expand_powerset_states();
    }

    /// Merge the base states' actions per symbol: accept wins, unanimous
    /// shifts merge into a powerset shift, unanimous same-rule reduces
    /// merge their fallbacks, anything else restarts.
    fn expand_powerset_states(&mut self) {
        let symbols: Vec<SymbolId> = self.gram.symbol_ids().collect();
        let mut index = self.restart_state.index();
        while index < self.states.len() {
            let state = StateId(index as u32);
            for &symbol in &symbols {
                let mut fallback_set: BTreeSet<StateId> = BTreeSet::new();
                let mut shift_set: BTreeSet<ParseAction> = BTreeSet::new();
                let mut reduce_set: BTreeSet<ParseAction> = BTreeSet::new();
                let mut accept_found = false;

                for base_state in self.states[index].base_states.clone() {
                    let Some(&action) = self.states[base_state.index()].action_map.get(&symbol)
                    else {
                        continue;
                    };
                    let base_is_lr0 =
                        self.states[base_state.index()].lr0_state == base_state;
                    match action.action_type {
                        ActionType::LaShift => {
                            if let Some(set) =
                                self.states[base_state.index()].after_shift.get(&symbol)
                            {
                                fallback_set.extend(set.iter().copied());
                            }
                        }
                        ActionType::Shift => {
                            if base_is_lr0 {
                                shift_set.insert(action);
                            } else {
                                fallback_set.insert(StateId(action.goto_state as u32));
                            }
                        }
                        ActionType::Reduce => {
                            if base_is_lr0 {
                                reduce_set.insert(action);
                            } else if let Some(set) =
                                self.states[base_state.index()].after_shift.get(&symbol)
                            {
                                fallback_set.extend(set.iter().copied());
                            }
                        }
                        ActionType::Goto => {
                            shift_set.insert(action);
                        }
                        ActionType::Accept => {
                            accept_found = true;
                        }
                        _ => {}
                    }
                }

                if accept_found {
                    self.states[index]
                        .action_map
                        .insert(symbol, ParseAction::of(ActionType::Accept));
                    continue;
                }
                if state == self.restart_state {
                    reduce_set.clear();
                }
                let total = shift_set.len() + reduce_set.len() + fallback_set.len();
                if total == 0 {
                    continue;
                }

                if shift_set.len() == total {
                    let gotos: Vec<StateId> = shift_set
                        .iter()
                        .map(|a| StateId(a.goto_state as u32))
                        .collect();
                    let goto_state = self.intern_state_set(sorted_unique(gotos));
                    let action = if self.gram.symbol(symbol).is_terminal {
                        ParseAction::shift(goto_state.index() as i64)
                    } else {
                        ParseAction::goto(goto_state.index() as i64)
                    };
                    self.states[index].action_map.insert(symbol, action);
                    continue;
                }

                if reduce_set.len() == total {
                    let rule_nums: BTreeSet<i64> =
                        reduce_set.iter().map(|a| a.rule_num).collect();
                    if rule_nums.len() == 1 {
                        let mut merged: BTreeSet<StateId> = BTreeSet::new();
                        for action in &reduce_set {
                            let fallback = StateId(action.fallback_state as u32);
                            merged.extend(
                                self.states[fallback.index()].base_states.iter().copied(),
                            );
                        }
                        let fallback = self.intern_state_set(merged.into_iter().collect());
                        let mut action =
                            ParseAction::reduce(*rule_nums.iter().next().unwrap());
                        action.fallback_state = fallback.index() as i64;
                        self.states[index].action_map.insert(symbol, action);
                        continue;
                    }
                }

                // An incompatible mixture merges into a restart.
                for action in &shift_set {
                    fallback_set.insert(StateId(action.goto_state as u32));
                }
                for action in &reduce_set {
                    let fallback = StateId(action.fallback_state as u32);
                    fallback_set
                        .extend(self.states[fallback.index()].base_states.iter().copied());
                }
                let target = self.intern_state_set(fallback_set.into_iter().collect());
                let mut action = ParseAction::of(ActionType::Restart);
                action.goto_state = target.index() as i64;
                self.states[index].action_map.insert(symbol, action);
            }
            index += 1;
        }
    }

    //
    //  Table flattening
    //

    /// Number symbols by descending use in the action maps; ties break
    /// terminal, then nonterminal, then everything else.
    fn renumber_symbols(&mut self) {
        let mut action_count: AHashMap<SymbolId, usize> = AHashMap::new();
        for state in &self.states {
            for &symbol in state.action_map.keys() {
                *action_count.entry(symbol).or_default() += 1;
            }
        }
        let mut symbol_list: Vec<SymbolId> = self.gram.symbol_ids().collect();
        symbol_list.sort_by(|&left, &right| {
            use std::cmp::Ordering;
            let left_count = action_count.get(&left);
            let right_count = action_count.get(&right);
            match (left_count, right_count) {
                (Some(_), None) => return Ordering::Less,
                (None, Some(_)) => return Ordering::Greater,
                (None, None) => return left.cmp(&right),
                _ => {}
            }
            let left_data = self.gram.symbol(left);
            let right_data = self.gram.symbol(right);
            if left_data.is_terminal != right_data.is_terminal {
                return right_data.is_terminal.cmp(&left_data.is_terminal);
            }
            if left_data.is_nonterminal != right_data.is_nonterminal {
                return right_data.is_nonterminal.cmp(&left_data.is_nonterminal);
            }
            right_count
                .unwrap()
                .cmp(left_count.unwrap())
                .then(left.cmp(&right))
        });
        for (number, &symbol) in symbol_list.iter().enumerate() {
            self.gram.symbol_mut(symbol).symbol_num = number as i64;
        }
    }

    fn flatten_tables(&mut self) -> LalrTables {
        self.renumber_symbols();

        let bits_needed = |size: usize| -> i64 {
            let mut bits = 1;
            while (1i64 << bits) <= size as i64 {
                bits += 1;
            }
            bits
        };
        let symbol_num_bits = bits_needed(self.gram.num_symbols());
        let action_type_bits = bits_needed(ActionType::Error as usize);
        let state_num_bits = bits_needed(self.states.len());
        let rule_num_bits = bits_needed(self.gram.rules.len());

        let mut tables = LalrTables {
            start_state: self.start_state.index() as i64,
            restart_state: self.restart_state.index() as i64,
            ..LalrTables::default()
        };

        let mut bits_used = [0i64; 8];
        let mut overflow = false;
        let mut allocate = |bits: i64, offset: &mut i64, shift: &mut i64, mask: &mut i64| {
            let mut word = 0;
            while word < bits_used.len() && bits_used[word] + bits > 64 {
                word += 1;
            }
            if word >= bits_used.len() {
                overflow = true;
                word = 0;
            }
            *offset = word as i64;
            *mask = (1i64 << bits) - 1;
            *shift = bits_used[word];
            bits_used[word] += bits;
        };
        allocate(
            symbol_num_bits,
            &mut tables.symbol_num_offset,
            &mut tables.symbol_num_shift,
            &mut tables.symbol_num_mask,
        );
        allocate(
            action_type_bits,
            &mut tables.action_type_offset,
            &mut tables.action_type_shift,
            &mut tables.action_type_mask,
        );
        allocate(
            rule_num_bits,
            &mut tables.rule_num_offset,
            &mut tables.rule_num_shift,
            &mut tables.rule_num_mask,
        );
        allocate(
            state_num_bits,
            &mut tables.state_num_offset,
            &mut tables.state_num_shift,
            &mut tables.state_num_mask,
        );
        allocate(
            state_num_bits,
            &mut tables.fallback_num_offset,
            &mut tables.fallback_num_shift,
            &mut tables.fallback_num_mask,
        );
        if overflow {
            self.errh.add_error(
                ErrorType::WordOverflow,
                -1,
                "Grammar too complex to encode",
            );
            return tables;
        }
        tables.num_offsets = bits_used.iter().filter(|&&used| used > 0).count() as i64;
        let num_offsets = tables.num_offsets;

        // Place the busiest rows first so they land at small offsets.
        let mut desc_states: Vec<StateId> = (0..self.states.len() as u32).map(StateId).collect();
        desc_states.sort_by_key(|s| std::cmp::Reverse(self.states[s.index()].action_map.len()));

        let num_symbols = self.gram.num_symbols() as i64;
        let mut used_indices: AHashSet<i64> = AHashSet::new();
        let mut checked_data: Vec<i64> = Vec::new();
        let mut checked_index: Vec<i64> = vec![-1; self.states.len()];

        for state in desc_states {
            let mut symbol_nums: Vec<(i64, ParseAction)> = self.states[state.index()]
                .action_map
                .iter()
                .map(|(&symbol, &action)| (self.gram.symbol(symbol).symbol_num, action))
                .collect();
            symbol_nums.sort_by_key(|&(num, _)| num);

            let mut offset = 0i64;
            loop {
                if !used_indices.contains(&offset) {
                    let fits = symbol_nums.iter().all(|&(num, _)| {
                        let index = (offset + num * num_offsets) as usize;
                        index >= checked_data.len() || checked_data[index] < 0
                    });
                    if fits {
                        break;
                    }
                }
                offset += num_offsets;
            }
            checked_index[state.index()] = offset;
            used_indices.insert(offset);

            let needed = (offset + num_symbols * num_offsets) as usize + 1;
            if checked_data.len() < needed {
                checked_data.resize(needed, -1);
            }

            for (num, action) in symbol_nums {
                let row = (offset + num * num_offsets) as usize;
                for word in 0..num_offsets as usize {
                    checked_data[row + word] = 0;
                }
                checked_data[row + tables.symbol_num_offset as usize] |=
                    num << tables.symbol_num_shift;
                checked_data[row + tables.action_type_offset as usize] |=
                    (action.action_type as i64) << tables.action_type_shift;
                if action.rule_num >= 0 {
                    checked_data[row + tables.rule_num_offset as usize] |=
                        action.rule_num << tables.rule_num_shift;
                }
                if action.goto_state >= 0 {
                    checked_data[row + tables.state_num_offset as usize] |=
                        action.goto_state << tables.state_num_shift;
                }
                if action.fallback_state >= 0 {
                    checked_data[row + tables.fallback_num_offset as usize] |=
                        action.fallback_state << tables.fallback_num_shift;
                }
            }
        }

        tables.checked_index = checked_index;
        tables.checked_data = checked_data;
        tables
    }

    //
    //  Debug listings
    //

    fn dump_first_sets(&self) -> String {
        let mut out = String::new();
        for id in self.gram.symbol_ids() {
            if !self.gram.symbol(id).is_nonterminal {
                continue;
            }
            let names: Vec<&str> = self.first_sets[id.index()]
                .ones()
                .map(|n| self.gram.symbol_name(SymbolId(n as u32)))
                .collect();
            let _ = writeln!(
                out,
                "{} -> {{{}}}",
                self.gram.symbol_name(id),
                names.join(", ")
            );
        }
        out
    }

    fn dump_item(&self, item: ItemId) -> String {
        let it = &self.items[item.index()];
        let rule = &self.gram.rules[it.rule.index()];
        let mut text = format!("{} ::=", self.gram.symbol_name(rule.lhs));
        for (position, &symbol) in rule.rhs.iter().enumerate() {
            if position == it.dot {
                text.push_str(" .");
            }
            let _ = write!(text, " {}", self.gram.symbol_name(symbol));
        }
        if it.dot == rule.rhs.len() {
            text.push_str(" .");
        }
        text
    }

    fn dump_state(&self, state: StateId) -> String {
        let mut out = String::new();
        let data = &self.states[state.index()];
        let _ = writeln!(out, "State {}", data.num);
        for &item in &data.item_set {
            let _ = writeln!(out, "    {}", self.dump_item(item));
        }
        for (symbol, actions) in &data.action_multimap {
            for action in actions {
                let _ = writeln!(
                    out,
                    "    {} => {:?}",
                    self.gram.symbol_name(*symbol),
                    action
                );
            }
        }
        for (symbol, action) in &data.action_map {
            let _ = writeln!(
                out,
                "    {} => {:?}",
                self.gram.symbol_name(*symbol),
                action
            );
        }
        out
    }

    fn dump_automaton(&self, title: &str) -> String {
        let mut out = format!("{title}\n");
        for index in 0..self.states.len() {
            out.push_str(&self.dump_state(StateId(index as u32)));
        }
        out
    }
}

fn sorted_unique(mut states: Vec<StateId>) -> Vec<StateId> {
    states.sort_unstable();
    states.dedup();
    states
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::extract_grammar;
    use crate::syntax::parse_grammar;

    fn tables_for(text: &str) -> (Grammar, ErrorHandler, Option<LalrTables>) {
        let root = parse_grammar(text).unwrap();
        let mut errh = ErrorHandler::new();
        let mut gram = extract_grammar(&root, &mut errh, DebugFlags::NONE);
        assert_eq!(errh.error_count(), 0, "extraction failed");
        let tables = generate_tables(&mut gram, &mut errh, DebugFlags::NONE);
        (gram, errh, tables)
    }

    fn decode(
        tables: &LalrTables,
        state: i64,
        symbol_num: i64,
    ) -> (ActionType, i64, i64, i64) {
        let index = (tables.checked_index[state as usize]
            + symbol_num * tables.num_offsets) as usize;
        if tables.checked_data[index] < 0 {
            return (ActionType::Error, 0, 0, 0);
        }
        let field = |offset: i64, shift: i64, mask: i64| {
            (tables.checked_data[index + offset as usize] >> shift) & mask
        };
        let found = field(
            tables.symbol_num_offset,
            tables.symbol_num_shift,
            tables.symbol_num_mask,
        );
        if found != symbol_num {
            return (ActionType::Error, 0, 0, 0);
        }
        (
            ActionType::from_repr(field(
                tables.action_type_offset,
                tables.action_type_shift,
                tables.action_type_mask,
            ) as u8)
            .unwrap(),
            field(tables.state_num_offset, tables.state_num_shift, tables.state_num_mask),
            field(tables.rule_num_offset, tables.rule_num_shift, tables.rule_num_mask),
            field(
                tables.fallback_num_offset,
                tables.fallback_num_shift,
                tables.fallback_num_mask,
            ),
        )
    }

    #[test]
    fn simple_grammar_generates() {
        let (gram, errh, tables) = tables_for("rules\n S ::= 'a' S | 'a'\n");
        assert_eq!(errh.error_count(), 0);
        let tables = tables.unwrap();
        assert!(tables.num_offsets >= 1);
        // Walking "a" from the start state has to reach a shift.
        let a = gram.lookup_symbol("'a'").unwrap();
        let (action, ..) = decode(&tables, tables.start_state, gram.symbol(a).symbol_num);
        assert_eq!(action, ActionType::Shift);
        // An unrelated symbol number decodes to an error.
        let eof_num = gram.symbol(gram.eof_symbol).symbol_num;
        let (action, ..) = decode(&tables, tables.start_state, eof_num);
        assert_eq!(action, ActionType::Error);
    }

    #[test]
    fn ambiguous_grammar_reports_conflicts() {
        let (_, errh, tables) = tables_for(
            "rules\n E ::= E '+' E | E '*' E | <integer>\n",
        );
        assert!(tables.is_none());
        assert!(errh.error_count() > 0);
    }

    #[test]
    fn lalr2_grammar_needs_lookahead_states() {
        // LALR(1) cannot decide between the two reductions after 'a';
        // one more token settles it.
        let (_, errh, tables) = tables_for(
            "options\n lookaheads = 2\nrules\n S ::= A 'x' 'p' | B 'x' 'q'\n A ::= 'a'\n B ::= 'a'\n",
        );
        assert_eq!(errh.error_count(), 0);
        assert!(tables.is_some());
    }

    #[test]
    fn same_grammar_fails_with_one_lookahead() {
        let (_, errh, tables) = tables_for(
            "rules\n S ::= A 'x' 'p' | B 'x' 'q'\n A ::= 'a'\n B ::= 'a'\n",
        );
        assert!(tables.is_none());
        assert!(errh.error_count() > 0);
    }

    #[test]
    fn reads_cycle_is_fatal() {
        // A nullable A in front of a recursion builds a nullable goto
        // self-loop; with k > 1 the generator has to refuse it.
        let (_, errh, tables) = tables_for(
            "options\n lookaheads = 2\nrules\n S ::= A S 'x' | 'y'\n A ::= empty\n",
        );
        assert!(tables.is_none());
        assert!(errh.error_count() > 0);
    }

    #[test]
    fn recovery_attaches_fallbacks() {
        let (gram, errh, tables) = tables_for("rules\n S ::= 'a' 'b' 'c'\n");
        assert_eq!(errh.error_count(), 0);
        let tables = tables.unwrap();
        assert!(tables.restart_state > 0);
        // Every reduce row decodes with a fallback inside the table.
        let num_states = tables.checked_index.len() as i64;
        for state in 0..num_states {
            for symbol in gram.symbol_ids() {
                let num = gram.symbol(symbol).symbol_num;
                let (action, _, _, fallback) = decode(&tables, state, num);
                if action == ActionType::Reduce {
                    assert!(fallback >= 0 && fallback < num_states);
                }
            }
        }
    }
}
