//! Instance lifecycle transitions.
//!
//! An instance is in one of three states (running, stopped, detached) and
//! its VM is present, lost (recorded but gone from the cloud) or absent.
//! [`transition`] maps that pair plus an [`Operation`] to the ordered
//! steps the updater executes and the state the instance ends in. The
//! table is exhaustive; every combination is covered by the tests below.

use std::fmt;

use armada_state::InstanceState;
use serde::{Deserialize, Serialize};

/// Whether the instance's VM exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VmStatus {
    Present,
    /// Recorded in state, but the CPI no longer has it.
    Lost,
    Absent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    /// Brand-new instance.
    Create,
    /// Apply new jobs/properties in place.
    Update,
    /// Replace the VM: stop, delete, create.
    Recreate,
    /// Replace the VM: create the new one first, then cut over.
    Hotswap,
    Start,
    Stop,
    /// Stop and delete the VM, keeping disks and IPs.
    StopHard,
    Restart,
    Delete,
}

impl Operation {
    /// Event action recorded for the operation.
    pub fn action(self) -> &'static str {
        match self {
            Operation::Create => "create",
            Operation::Update => "update",
            Operation::Recreate | Operation::Hotswap => "recreate",
            Operation::Start => "start",
            Operation::Stop | Operation::StopHard => "stop",
            Operation::Restart => "restart",
            Operation::Delete => "delete",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.action())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Step {
    PreStop,
    Drain,
    StopJobs,
    DetachDisks,
    DeleteVm,
    CreateVm,
    /// Create the replacement VM next to the running one.
    CreatePendingVm,
    /// Promote the pending VM; the old one becomes inactive.
    Cutover,
    /// Delete the VM replaced by a cutover.
    DeleteOldVm,
    AttachDisks,
    /// Converge the persistent disk onto the desired spec.
    EnsureDisk,
    ApplySpec,
    PreStart,
    StartJobs,
    PostStart,
    Watch,
}

/// Steps to run and the state the instance ends in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub steps: Vec<Step>,
    pub target: InstanceState,
}

use Step::*;

const STOP: [Step; 3] = [PreStop, Drain, StopJobs];
const BOOT: [Step; 5] = [CreateVm, AttachDisks, EnsureDisk, ApplySpec, PreStart];
const START: [Step; 3] = [StartJobs, PostStart, Watch];

fn steps(parts: &[&[Step]]) -> Vec<Step> {
    parts.iter().flat_map(|p| p.iter().copied()).collect()
}

fn to(target: InstanceState, parts: &[&[Step]]) -> Transition {
    Transition {
        steps: steps(parts),
        target,
    }
}

/// Compute the transition for `op` on an instance in `state` whose VM is `vm`.
pub fn transition(state: InstanceState, vm: VmStatus, op: Operation) -> Transition {
    use InstanceState::*;
    use Operation::*;
    use VmStatus::*;

    // A lost VM can neither be stopped nor updated in place: the record
    // is cleaned up and the VM rebuilt.
    match (op, state, vm) {
        (Create, _, Lost) => to(Running, &[&[DeleteVm], &BOOT, &START]),
        (Create, _, _) => to(Running, &[&BOOT, &START]),

        (Update, Running, Present) => to(Running, &[&STOP, &[EnsureDisk, ApplySpec, PreStart], &START]),
        (Update, Stopped, Present) => to(Stopped, &[&[EnsureDisk, ApplySpec]]),
        (Update, Running | Stopped, Lost) => to(state, &[&[DeleteVm], &BOOT, start_if(state)]),
        (Update, Running | Stopped, Absent) => to(state, &[&BOOT, start_if(state)]),
        (Update, Detached, _) => to(Detached, &[]),

        (Recreate, Running, Present) => to(Running, &[&STOP, &[DetachDisks, DeleteVm], &BOOT, &START]),
        (Recreate, Stopped, Present) => to(Stopped, &[&[DetachDisks, DeleteVm], &BOOT]),
        (Recreate, Running | Stopped, Lost) => to(state, &[&[DeleteVm], &BOOT, start_if(state)]),
        (Recreate, Running | Stopped, Absent) => to(state, &[&BOOT, start_if(state)]),
        (Recreate, Detached, _) => to(Detached, &[]),

        (Hotswap, Running, Present) => to(
            Running,
            &[
                &[CreatePendingVm],
                &STOP,
                &[DetachDisks, Cutover, AttachDisks, EnsureDisk, ApplySpec, PreStart],
                &START,
                &[DeleteOldVm],
            ],
        ),
        (Hotswap, Stopped, Present) => to(
            Stopped,
            &[&[CreatePendingVm, DetachDisks, Cutover, AttachDisks, EnsureDisk, ApplySpec, DeleteOldVm]],
        ),
        // Nothing to swap against; fall back to a plain rebuild.
        (Hotswap, Running | Stopped, Lost | Absent) => transition(state, vm, Recreate),
        (Hotswap, Detached, _) => to(Detached, &[]),

        (Start, Running, Present) => to(Running, &[]),
        (Start, Stopped, Present) => to(Running, &[&[PreStart], &START]),
        (Start, _, Lost) => to(Running, &[&[DeleteVm], &BOOT, &START]),
        (Start, _, Absent) => to(Running, &[&BOOT, &START]),
        (Start, Detached, Present) => to(Running, &[&[PreStart], &START]),

        (Stop, Running, Present) => to(Stopped, &STOP_ONLY),
        (Stop, Stopped, _) => to(Stopped, &[]),
        (Stop, Running, Lost | Absent) => to(Stopped, &[]),
        (Stop, Detached, _) => to(Detached, &[]),

        (StopHard, Running, Present) => to(Detached, &[&STOP, &[DetachDisks, DeleteVm]]),
        (StopHard, Stopped | Detached, Present) => to(Detached, &[&[DetachDisks, DeleteVm]]),
        (StopHard, _, Lost) => to(Detached, &[&[DeleteVm]]),
        (StopHard, _, Absent) => to(Detached, &[]),

        (Restart, Running, Present) => to(Running, &[&STOP, &[PreStart], &START]),
        (Restart, Stopped | Detached, Present) => to(Running, &[&[PreStart], &START]),
        (Restart, _, Lost) => to(Running, &[&[DeleteVm], &BOOT, &START]),
        (Restart, _, Absent) => to(Running, &[&BOOT, &START]),

        (Delete, Running, Present) => to(Detached, &[&STOP, &[DetachDisks, DeleteVm]]),
        (Delete, Stopped | Detached, Present) => to(Detached, &[&[DetachDisks, DeleteVm]]),
        (Delete, _, Lost) => to(Detached, &[&[DeleteVm]]),
        (Delete, _, Absent) => to(Detached, &[]),
    }
}

const STOP_ONLY: [&[Step]; 1] = [&STOP];

fn start_if(state: InstanceState) -> &'static [Step] {
    match state {
        InstanceState::Running => &START,
        InstanceState::Stopped | InstanceState::Detached => &[],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use InstanceState::*;

    const STATES: [InstanceState; 3] = [Running, Stopped, Detached];
    const VMS: [VmStatus; 3] = [VmStatus::Present, VmStatus::Lost, VmStatus::Absent];
    const OPS: [Operation; 9] = [
        Operation::Create,
        Operation::Update,
        Operation::Recreate,
        Operation::Hotswap,
        Operation::Start,
        Operation::Stop,
        Operation::StopHard,
        Operation::Restart,
        Operation::Delete,
    ];

    fn t(op: Operation, state: InstanceState, vm: VmStatus) -> Transition {
        transition(state, vm, op)
    }

    /// Steps that talk to the agent on the current VM.
    fn needs_agent(steps: &[Step]) -> bool {
        steps.iter().any(|s| !matches!(s, DeleteVm | CreateVm | CreatePendingVm | DeleteOldVm))
    }

    #[test]
    fn every_combination_is_consistent() {
        for op in OPS {
            for state in STATES {
                for vm in VMS {
                    let tr = t(op, state, vm);
                    let creates = tr.steps.contains(&CreateVm) || tr.steps.contains(&CreatePendingVm);

                    // A lost VM is always cleaned up before anything else.
                    if vm == VmStatus::Lost && !tr.steps.is_empty() {
                        assert_eq!(tr.steps[0], DeleteVm, "{op:?} {state:?} {vm:?}");
                    }
                    // Agent steps never run against a VM that isn't there.
                    if vm != VmStatus::Present && !creates {
                        assert!(!needs_agent(&tr.steps), "{op:?} {state:?} {vm:?}");
                    }
                    // Detached means no VM afterwards; anything else keeps one.
                    if tr.target == Detached {
                        assert!(!tr.steps.contains(&CreateVm), "{op:?} {state:?} {vm:?}");
                    }
                    // Jobs only start when the instance ends up running.
                    if tr.steps.contains(&StartJobs) {
                        assert_eq!(tr.target, Running, "{op:?} {state:?} {vm:?}");
                    }
                    // Disks come off before the VM they are attached to goes.
                    if vm == VmStatus::Present && tr.steps.contains(&DeleteVm) {
                        let detach = tr.steps.iter().position(|s| *s == DetachDisks).unwrap();
                        let delete = tr.steps.iter().position(|s| *s == DeleteVm).unwrap();
                        assert!(detach < delete, "{op:?} {state:?} {vm:?}");
                    }
                    // Pre-stop runs before drain, drain before stop.
                    if let Some(pre) = tr.steps.iter().position(|s| *s == PreStop) {
                        assert_eq!(tr.steps[pre + 1], Drain);
                        assert_eq!(tr.steps[pre + 2], StopJobs);
                    }
                }
            }
        }
    }

    #[test]
    fn update_in_place_keeps_the_vm() {
        let tr = t(Operation::Update, Running, VmStatus::Present);
        assert!(!tr.steps.contains(&DeleteVm));
        assert!(!tr.steps.contains(&CreateVm));
        assert_eq!(tr.steps.first(), Some(&PreStop));
        assert_eq!(tr.steps.last(), Some(&Watch));
    }

    #[test]
    fn stopped_instances_stay_stopped_across_updates() {
        assert_eq!(t(Operation::Update, Stopped, VmStatus::Present).target, Stopped);
        let recreate = t(Operation::Recreate, Stopped, VmStatus::Present);
        assert_eq!(recreate.target, Stopped);
        assert!(!recreate.steps.contains(&StartJobs));
    }

    #[test]
    fn detached_instances_ignore_converging_operations() {
        for op in [Operation::Update, Operation::Recreate, Operation::Hotswap] {
            assert_eq!(t(op, Detached, VmStatus::Absent), to(Detached, &[]));
        }
    }

    #[test]
    fn hard_stop_deletes_the_vm() {
        let tr = t(Operation::StopHard, Running, VmStatus::Present);
        assert_eq!(tr.target, Detached);
        assert_eq!(tr.steps, vec![PreStop, Drain, StopJobs, DetachDisks, DeleteVm]);
    }

    #[test]
    fn start_from_detached_rebuilds() {
        let tr = t(Operation::Start, Detached, VmStatus::Absent);
        assert_eq!(tr.target, Running);
        assert_eq!(tr.steps[0], CreateVm);
        assert!(tr.steps.contains(&AttachDisks));
    }

    #[test]
    fn hotswap_creates_before_deleting() {
        let tr = t(Operation::Hotswap, Running, VmStatus::Present);
        let create = tr.steps.iter().position(|s| *s == CreatePendingVm).unwrap();
        let stop = tr.steps.iter().position(|s| *s == StopJobs).unwrap();
        let delete = tr.steps.iter().position(|s| *s == DeleteOldVm).unwrap();
        assert!(create < stop && stop < delete);
        assert_eq!(tr.steps.last(), Some(&DeleteOldVm));
        // Without a VM to swap against it is a recreate.
        assert_eq!(
            t(Operation::Hotswap, Running, VmStatus::Lost),
            t(Operation::Recreate, Running, VmStatus::Lost)
        );
    }

    #[test]
    fn lost_vm_recreate_skips_stop() {
        let tr = t(Operation::Recreate, Running, VmStatus::Lost);
        assert_eq!(tr.steps[0], DeleteVm);
        assert!(!tr.steps.contains(&PreStop));
        assert!(tr.steps.contains(&CreateVm));
    }

    #[test]
    fn delete_of_stopped_instance_skips_scripts() {
        let tr = t(Operation::Delete, Stopped, VmStatus::Present);
        assert_eq!(tr.steps, vec![DetachDisks, DeleteVm]);
    }

    #[test]
    fn actions() {
        assert_eq!(Operation::Hotswap.action(), "recreate");
        assert_eq!(Operation::StopHard.to_string(), "stop");
    }
}
