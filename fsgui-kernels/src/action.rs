//! Trigger-tree evaluator and stimulator: folds a trigger
//! tree (and an optional condition tree) over cached boolean inputs, runs
//! the idle/triggered lockout state machine, and fires fire-and-forget
//! hardware requests. Grounded on
//! `examples/original_source/fsgui/mock/action.py` (gate-folding
//! evaluator) and
//! `examples/original_source/fsgui/spikegadgets/action/{shortcut,pulse}.py`
//! (lockout transition table and statescript template).

use crate::kernel::{InboundMap, LogLevel, NodeKernel, ServiceMap, WorkerContext, Workload};
use crate::params::{bool_or, i64_or};
use fsgui_core::error::BuildError;
use fsgui_core::transport::{Consumer, MultiPoller, Subscriber};
use fsgui_core::types::{InstanceId, NodeClass, ParamDescriptor, ParamKind, ParamValues, TriggerTree};
use fsgui_core::value::Value;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::time::{Duration, Instant};

const HARDWARE_REQUEST_TIMEOUT: Duration = Duration::from_millis(500);
const DELAY_FLAG_OFFSET: i64 = 10;

pub struct StimulatorKernel {
    schema: Vec<ParamDescriptor>,
}

impl StimulatorKernel {
    pub fn new() -> Self {
        let schema = vec![
            ParamDescriptor::new("trigger", ParamKind::TriggerTree, Value::Bool(false)),
            ParamDescriptor::new("condition", ParamKind::TriggerTree, Value::Bool(false)),
            ParamDescriptor::new("action_enabled", ParamKind::Bool, Value::Bool(false)).live_editable(),
            ParamDescriptor::new("off_when_false", ParamKind::Bool, Value::Bool(false)).live_editable(),
            ParamDescriptor::new("delay_flag", ParamKind::Bool, Value::Bool(false)).live_editable(),
            ParamDescriptor::new("lockout_time_ms", ParamKind::Int { lower: 0, upper: 100_000 }, Value::Int(0)),
            ParamDescriptor::new("on_fn", ParamKind::Int { lower: 0, upper: 32 }, Value::Int(0)),
            ParamDescriptor::new("off_fn", ParamKind::Int { lower: 0, upper: 32 }, Value::Int(1)),
            ParamDescriptor::new("pulse_length_ms", ParamKind::Int { lower: 1, upper: 500 }, Value::Int(1)),
            ParamDescriptor::new("n_pulses", ParamKind::Int { lower: 0, upper: 10_000 }, Value::Int(1)),
            ParamDescriptor::new("pre_delay_ms", ParamKind::Int { lower: 0, upper: 1000 }, Value::Int(0)),
            ParamDescriptor::new("sequence_period_ms", ParamKind::Int { lower: 1, upper: 5000 }, Value::Int(100)),
            ParamDescriptor::new("n_trains", ParamKind::Int { lower: 0, upper: 200 }, Value::Int(1)),
            ParamDescriptor::new("train_interval_ms", ParamKind::Int { lower: 100, upper: 60_000 }, Value::Int(1000)),
            ParamDescriptor::new("primary_pin", ParamKind::Int { lower: 1, upper: 64 }, Value::Int(1)),
        ];
        Self { schema }
    }
}

impl Default for StimulatorKernel {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeKernel for StimulatorKernel {
    fn type_id(&self) -> &'static str {
        "action.stimulator"
    }
    fn class(&self) -> NodeClass {
        NodeClass::Action
    }
    fn datatype(&self) -> fsgui_core::types::Datatype {
        // Action nodes publish nothing on the data plane; `Bool` stands in
        // for "most recently effective trigger value" on the telemetry
        // plane only.
        fsgui_core::types::Datatype::Bool
    }
    fn schema(&self) -> &[ParamDescriptor] {
        &self.schema
    }

    fn build(&self, params: &ParamValues, mut inbound: InboundMap, mut services: ServiceMap) -> Result<Box<dyn Workload>, BuildError> {
        let trigger = params
            .get("trigger")
            .and_then(TriggerTree::from_value)
            .ok_or_else(|| BuildError { message: "stimulator: missing or malformed \"trigger\" tree".to_string() })?;
        let condition = params.get("condition").and_then(TriggerTree::from_value);

        let mut leaf_subscribers = BTreeMap::new();
        for id in trigger.leaf_ids().into_iter().chain(condition.iter().flat_map(|c| c.leaf_ids())) {
            let key = id.to_string();
            if let Some(sub) = inbound.remove(&key) {
                leaf_subscribers.insert(id, sub);
            }
        }

        let statescript = StatescriptParams {
            function_num: i64_or(params, "on_fn", 0),
            pre_delay: i64_or(params, "pre_delay_ms", 0),
            n_pulses: i64_or(params, "n_pulses", 1),
            n_trains: i64_or(params, "n_trains", 1),
            train_interval: i64_or(params, "train_interval_ms", 1000),
            sequence_period: i64_or(params, "sequence_period_ms", 100),
            primary_pin: i64_or(params, "primary_pin", 1),
            pulse_length: i64_or(params, "pulse_length_ms", 1),
            delay_flag: bool_or(params, "delay_flag", false),
        };
        let script = generate_statescript(&statescript);
        if let Some(statescript_service) = services.remove("statescript.service") {
            let mut payload = BTreeMap::new();
            payload.insert("command".to_string(), Value::String(script));
            let _ = statescript_service.request(&Value::Map(payload), HARDWARE_REQUEST_TIMEOUT);
        }

        let core = ActionCore {
            trigger,
            condition,
            cached: BTreeMap::new(),
            state: ActionState::Idle,
            action_enabled: bool_or(params, "action_enabled", false),
            off_when_false: bool_or(params, "off_when_false", false),
            delay_flag: bool_or(params, "delay_flag", false),
            lockout_time_ms: i64_or(params, "lockout_time_ms", 0),
            on_fn: i64_or(params, "on_fn", 0),
            off_fn: i64_or(params, "off_fn", 1),
            last_triggered_ms: None,
        };

        Ok(Box::new(StimulatorWorkload {
            core,
            leaf_subscribers,
            hardware: services.remove("trodes.hardware"),
            start: Instant::now(),
        }))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ActionState {
    Idle,
    Triggered,
}

/// The side effect a tick of the transition table produces: either nothing,
/// or a fire-and-forget request to the hardware service naming a function
/// slot: `on_fn` (or `on_fn + 10` if `delay_flag` is set).
#[derive(Debug, PartialEq)]
pub enum Effect {
    None,
    Call(i64),
}

/// The pure lockout state machine, free of any transport type.
pub struct ActionCore {
    trigger: TriggerTree,
    condition: Option<TriggerTree>,
    cached: BTreeMap<InstanceId, bool>,
    state: ActionState,
    action_enabled: bool,
    off_when_false: bool,
    delay_flag: bool,
    lockout_time_ms: i64,
    on_fn: i64,
    off_fn: i64,
    last_triggered_ms: Option<i64>,
}

impl ActionCore {
    pub fn update_leaf(&mut self, id: InstanceId, value: bool) {
        self.cached.insert(id, value);
    }

    pub fn apply_update(&mut self, name: &str, value: Value) {
        match name {
            "action_enabled" => {
                if let Some(b) = value.as_bool() {
                    self.action_enabled = b;
                }
            }
            "off_when_false" => {
                if let Some(b) = value.as_bool() {
                    self.off_when_false = b;
                }
            }
            "delay_flag" => {
                if let Some(b) = value.as_bool() {
                    self.delay_flag = b;
                }
            }
            _ => {}
        }
    }

    fn on_effect(&self) -> Effect {
        Effect::Call(if self.delay_flag { self.on_fn + DELAY_FLAG_OFFSET } else { self.on_fn })
    }

    /// One tick of the idle/triggered/lockout transition table.
    pub fn tick(&mut self, now_ms: i64) -> Effect {
        let trigger_value = self.trigger.evaluate(&self.cached);
        let condition_value = self.condition.as_ref().map(|c| c.evaluate(&self.cached)).unwrap_or(true);
        let effective = trigger_value && condition_value;

        match self.state {
            ActionState::Idle => {
                if effective && self.action_enabled {
                    self.state = ActionState::Triggered;
                    self.last_triggered_ms = Some(now_ms);
                    self.on_effect()
                } else {
                    Effect::None
                }
            }
            ActionState::Triggered => {
                if !self.action_enabled {
                    self.state = ActionState::Idle;
                    return Effect::Call(self.off_fn);
                }
                if effective {
                    return Effect::None;
                }
                let elapsed = now_ms - self.last_triggered_ms.unwrap_or(now_ms);
                if elapsed >= self.lockout_time_ms {
                    self.state = ActionState::Idle;
                    if self.off_when_false {
                        Effect::Call(self.off_fn)
                    } else {
                        Effect::None
                    }
                } else {
                    Effect::None
                }
            }
        }
    }
}

/// The eight free parameters a build-time statescript template needs.
pub struct StatescriptParams {
    pub function_num: i64,
    pub pre_delay: i64,
    pub n_pulses: i64,
    pub n_trains: i64,
    pub train_interval: i64,
    pub sequence_period: i64,
    pub primary_pin: i64,
    pub pulse_length: i64,
    pub delay_flag: bool,
}

/// Produce the opaque statescript text declaring this function slot's pulse
/// train, submitted once at build time. Purely a string
/// template: the runtime never interprets this text itself.
pub fn generate_statescript(p: &StatescriptParams) -> String {
    let mut script = String::new();
    let _ = writeln!(script, "function {}", p.function_num);
    let _ = writeln!(script, "portout[{}] = 0", p.primary_pin);
    if p.delay_flag {
        let _ = writeln!(script, "delay(300 + random(200))");
    }
    let _ = writeln!(script, "delay({})", p.pre_delay);
    let trains = if p.n_trains == 0 { "inf".to_string() } else { p.n_trains.to_string() };
    let _ = writeln!(script, "loop {} {{", trains);
    let _ = writeln!(script, "\tloop {} {{", p.n_pulses);
    let _ = writeln!(script, "\t\tportout[{}] = 1", p.primary_pin);
    let _ = writeln!(script, "\t\tdelay({})", p.pulse_length);
    let _ = writeln!(script, "\t\tportout[{}] = 0", p.primary_pin);
    let _ = writeln!(script, "\t\tdelay({})", p.sequence_period);
    let _ = writeln!(script, "\t}}");
    let _ = writeln!(script, "\tdelay({})", p.train_interval);
    let _ = writeln!(script, "}}");
    let _ = writeln!(script, "end;");
    script
}

struct StimulatorWorkload {
    core: ActionCore,
    leaf_subscribers: BTreeMap<InstanceId, Subscriber>,
    hardware: Option<Consumer>,
    start: Instant,
}

impl Workload for StimulatorWorkload {
    fn step(&mut self, ctx: &mut dyn WorkerContext) -> anyhow::Result<()> {
        if !self.leaf_subscribers.is_empty() {
            let subs: Vec<&Subscriber> = self.leaf_subscribers.values().collect();
            let poller = MultiPoller::new(subs);
            let ready = poller.poll(Duration::from_millis(200))?;
            let ids: Vec<InstanceId> = self.leaf_subscribers.keys().copied().collect();
            for idx in ready {
                if let Some(&id) = ids.get(idx) {
                    if let Some(sub) = self.leaf_subscribers.get(&id) {
                        if let Some(value) = sub.try_recv()? {
                            if let Some(b) = value.as_bool() {
                                self.core.update_leaf(id, b);
                            }
                        }
                    }
                }
            }
        } else {
            std::thread::sleep(Duration::from_millis(200));
        }

        let now_ms = self.start.elapsed().as_millis() as i64;
        let effect = self.core.tick(now_ms);
        if let Effect::Call(fn_num) = effect {
            if let Some(hardware) = &self.hardware {
                let mut payload = BTreeMap::new();
                payload.insert("tag".to_string(), Value::String("HRSCTrig".to_string()));
                payload.insert("fn".to_string(), Value::Int(fn_num));
                if let Err(e) = hardware.request(&Value::Map(payload), HARDWARE_REQUEST_TIMEOUT) {
                    ctx.log(LogLevel::Warning, &format!("stimulator: hardware request failed: {e}"));
                }
            }
        }
        Ok(())
    }

    fn apply_update(&mut self, name: &str, value: Value) {
        self.core.apply_update(name, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(id: InstanceId) -> TriggerTree {
        TriggerTree::Leaf { instance_id: id }
    }

    fn core(trigger: TriggerTree, condition: Option<TriggerTree>) -> ActionCore {
        ActionCore {
            trigger,
            condition,
            cached: BTreeMap::new(),
            state: ActionState::Idle,
            action_enabled: true,
            off_when_false: false,
            delay_flag: false,
            lockout_time_ms: 100,
            on_fn: 3,
            off_fn: 4,
            last_triggered_ms: None,
        }
    }

    #[test]
    fn idle_to_triggered_calls_on_fn_when_enabled() {
        let x = InstanceId::new();
        let mut c = core(leaf(x), None);
        c.update_leaf(x, true);
        assert_eq!(c.tick(0), Effect::Call(3));
        assert_eq!(c.state, ActionState::Triggered);
    }

    #[test]
    fn delay_flag_adds_ten_to_the_on_function_number() {
        let x = InstanceId::new();
        let mut c = core(leaf(x), None);
        c.delay_flag = true;
        c.update_leaf(x, true);
        assert_eq!(c.tick(0), Effect::Call(13));
    }

    #[test]
    fn stays_triggered_through_lockout_even_when_input_goes_false() {
        let x = InstanceId::new();
        let mut c = core(leaf(x), None);
        c.update_leaf(x, true);
        c.tick(0);
        c.update_leaf(x, false);
        assert_eq!(c.tick(50), Effect::None);
        assert_eq!(c.state, ActionState::Triggered);
    }

    #[test]
    fn off_when_false_fires_off_fn_once_lockout_elapses() {
        let x = InstanceId::new();
        let mut c = core(leaf(x), None);
        c.off_when_false = true;
        c.update_leaf(x, true);
        c.tick(0);
        c.update_leaf(x, false);
        assert_eq!(c.tick(150), Effect::Call(4));
        assert_eq!(c.state, ActionState::Idle);
    }

    #[test]
    fn without_off_when_false_lockout_elapsing_returns_to_idle_silently() {
        let x = InstanceId::new();
        let mut c = core(leaf(x), None);
        c.update_leaf(x, true);
        c.tick(0);
        c.update_leaf(x, false);
        assert_eq!(c.tick(150), Effect::None);
        assert_eq!(c.state, ActionState::Idle);
    }

    #[test]
    fn disabling_mid_trigger_forces_off_fn_regardless_of_lockout() {
        let x = InstanceId::new();
        let mut c = core(leaf(x), None);
        c.update_leaf(x, true);
        c.tick(0);
        c.action_enabled = false;
        assert_eq!(c.tick(1), Effect::Call(4));
        assert_eq!(c.state, ActionState::Idle);
    }

    #[test]
    fn condition_tree_gates_the_trigger_with_and() {
        let x = InstanceId::new();
        let y = InstanceId::new();
        let mut c = core(leaf(x), Some(leaf(y)));
        c.update_leaf(x, true);
        c.update_leaf(y, false);
        assert_eq!(c.tick(0), Effect::None);
        c.update_leaf(y, true);
        assert_eq!(c.tick(1), Effect::Call(3));
    }

    #[test]
    fn generated_statescript_names_the_declared_function_slot() {
        let script = generate_statescript(&StatescriptParams {
            function_num: 7,
            pre_delay: 0,
            n_pulses: 5,
            n_trains: 1,
            train_interval: 1000,
            sequence_period: 100,
            primary_pin: 2,
            pulse_length: 10,
            delay_flag: false,
        });
        assert!(script.contains("function 7"));
        assert!(script.contains("portout[2]"));
    }
}
