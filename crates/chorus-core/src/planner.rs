//! Controller allocation planning.
//!
//! [`plan`] is a pure function over an object-tree snapshot: it decides
//! which controller the target speaker should use and which existing
//! connections must be vacated first. The caller applies the disconnect
//! list before acting on the chosen controller.

use std::collections::HashSet;

use chorus_bluetooth::{Address, ControllerId, ControllerView, Snapshot};
use tracing::{debug, info};

/// An ordered list of (device, controller) connections to vacate.
pub type Disconnects = Vec<(Address, ControllerId)>;

/// Outcome of planning one connection request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AllocationPlan {
    /// The target already holds a usable controller.
    AlreadyConnected {
        controller: ControllerId,
        disconnects: Disconnects,
    },
    /// The target must be (re)connected on the given controller.
    NeedsConnection {
        controller: ControllerId,
        disconnects: Disconnects,
    },
    /// No free or freeable controller exists.
    Unavailable { disconnects: Disconnects },
}

impl AllocationPlan {
    /// Connections to vacate before acting on the plan.
    pub fn disconnects(&self) -> &[(Address, ControllerId)] {
        match self {
            AllocationPlan::AlreadyConnected { disconnects, .. }
            | AllocationPlan::NeedsConnection { disconnects, .. }
            | AllocationPlan::Unavailable { disconnects } => disconnects,
        }
    }
}

/// Decide how to get `target` connected, given the configured speaker set
/// and a snapshot of the object tree.
///
/// The reserved controller is never allocated. "First found" choices
/// follow snapshot iteration order; the order is deterministic per
/// snapshot but otherwise meaningless. The function has no side effects.
pub fn plan(
    target: &Address,
    allowed: &HashSet<Address>,
    snapshot: &Snapshot,
    reserved: &ControllerId,
) -> AllocationPlan {
    let controllers: Vec<&ControllerView> = snapshot
        .controllers
        .iter()
        .filter(|c| &c.id != reserved)
        .collect();

    debug!("Planning connection for target {}", target);

    let mut disconnects: Disconnects = Vec::new();
    // Controllers the target currently occupies, in snapshot order.
    let mut target_on: Vec<ControllerId> = Vec::new();
    // Controllers held by each configured speaker, keyed in first-seen order.
    let mut usage: Vec<(Address, Vec<ControllerId>)> = Vec::new();
    // Controllers claimed by a configured speaker other than the target.
    let mut occupied: HashSet<ControllerId> = HashSet::new();

    for view in &controllers {
        for device in &view.devices {
            if !device.connected {
                continue;
            }
            debug!("Found connected device {} on {}", device.address, view.id);

            if allowed.contains(&device.address) {
                push_usage(&mut usage, &device.address, &view.id);
            }

            if &device.address == target {
                target_on.push(view.id.clone());
            } else if !allowed.contains(&device.address) {
                info!(
                    "Unrecognized device {} on {} marked for disconnection",
                    device.address, view.id
                );
                disconnects.push((device.address.clone(), view.id.clone()));
            } else {
                occupied.insert(view.id.clone());
            }
        }
    }

    // Target connected more than once: keep the first, vacate the rest.
    if target_on.len() > 1 {
        let keep = target_on[0].clone();
        for controller in target_on.into_iter().skip(1) {
            disconnects.push((target.clone(), controller));
        }
        info!("Target {} connected on multiple controllers, keeping {}", target, keep);
        return AllocationPlan::AlreadyConnected {
            controller: keep,
            disconnects,
        };
    }

    // Target connected exactly once: usable unless a configured speaker
    // shares the controller.
    if let Some(current) = target_on.first() {
        let contested = usage
            .iter()
            .any(|(address, held)| address != target && held.contains(current));
        if !contested {
            return AllocationPlan::AlreadyConnected {
                controller: current.clone(),
                disconnects,
            };
        }

        info!("Target {} shares {} with another speaker, reallocating", target, current);
        disconnects.push((target.clone(), current.clone()));

        for view in &controllers {
            if !occupied.contains(&view.id) && &view.id != current {
                info!("Assigning free controller {} to {}", view.id, target);
                return AllocationPlan::NeedsConnection {
                    controller: view.id.clone(),
                    disconnects,
                };
            }
        }
        if let Some(plan) = free_duplicate(&usage, &mut disconnects, target) {
            return plan;
        }

        info!("No controller available after rebalance for {}", target);
        return AllocationPlan::Unavailable { disconnects };
    }

    // Target not connected anywhere: free controller first, else free a
    // duplicate.
    for view in &controllers {
        if !occupied.contains(&view.id) {
            info!("Free controller {} found for {}", view.id, target);
            return AllocationPlan::NeedsConnection {
                controller: view.id.clone(),
                disconnects,
            };
        }
    }
    if let Some(plan) = free_duplicate(&usage, &mut disconnects, target) {
        return plan;
    }

    info!("No available controller found for {}", target);
    AllocationPlan::Unavailable { disconnects }
}

fn push_usage(usage: &mut Vec<(Address, Vec<ControllerId>)>, address: &Address, id: &ControllerId) {
    match usage.iter_mut().find(|(a, _)| a == address) {
        Some((_, held)) => held.push(id.clone()),
        None => usage.push((address.clone(), vec![id.clone()])),
    }
}

/// Take the second controller of the first speaker occupying more than
/// one. Which of a duplicate pair gets freed is a tie-break with no deeper
/// meaning.
fn free_duplicate(
    usage: &[(Address, Vec<ControllerId>)],
    disconnects: &mut Disconnects,
    target: &Address,
) -> Option<AllocationPlan> {
    let (address, held) = usage.iter().find(|(_, held)| held.len() > 1)?;
    let freed = held[1].clone();
    info!("Freeing {} from {} to connect {}", freed, address, target);
    disconnects.push((address.clone(), freed.clone()));
    Some(AllocationPlan::NeedsConnection {
        controller: freed,
        disconnects: std::mem::take(disconnects),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chorus_bluetooth::DeviceView;

    const A: &str = "AA:AA:AA:AA:AA:AA";
    const B: &str = "BB:BB:BB:BB:BB:BB";
    const ROGUE: &str = "99:99:99:99:99:99";

    fn reserved() -> ControllerId {
        ControllerId::new("hci9")
    }

    fn connected(addr: &str) -> DeviceView {
        DeviceView {
            address: Address::new(addr),
            connected: true,
            paired: true,
            ..DeviceView::default()
        }
    }

    fn controller(id: &str, devices: Vec<DeviceView>) -> ControllerView {
        ControllerView {
            id: ControllerId::new(id),
            address: Address::new("10:00:00:00:00:00"),
            devices,
        }
    }

    fn allowed(addrs: &[&str]) -> HashSet<Address> {
        addrs.iter().map(|a| Address::new(*a)).collect()
    }

    #[test]
    fn uncontested_connection_is_kept_with_no_disconnects() {
        // A on hci0, B on hci1, both uncontested; target B.
        let snapshot = Snapshot {
            controllers: vec![
                controller("hci0", vec![connected(A)]),
                controller("hci1", vec![connected(B)]),
            ],
        };
        let plan = plan(&Address::new(B), &allowed(&[A, B]), &snapshot, &reserved());
        assert_eq!(
            plan,
            AllocationPlan::AlreadyConnected {
                controller: ControllerId::new("hci1"),
                disconnects: vec![],
            }
        );
    }

    #[test]
    fn unconnected_target_takes_a_free_controller() {
        // A alone occupies hci0; hci1 is free; target B not connected.
        let snapshot = Snapshot {
            controllers: vec![
                controller("hci0", vec![connected(A)]),
                controller("hci1", vec![]),
            ],
        };
        let plan = plan(&Address::new(B), &allowed(&[A, B]), &snapshot, &reserved());
        assert_eq!(
            plan,
            AllocationPlan::NeedsConnection {
                controller: ControllerId::new("hci1"),
                disconnects: vec![],
            }
        );
    }

    #[test]
    fn no_free_or_freeable_controller_is_unavailable() {
        // Only hci0 exists and A occupies it; target B.
        let snapshot = Snapshot {
            controllers: vec![controller("hci0", vec![connected(A)])],
        };
        let plan = plan(&Address::new(B), &allowed(&[A, B]), &snapshot, &reserved());
        assert_eq!(plan, AllocationPlan::Unavailable { disconnects: vec![] });
    }

    #[test]
    fn shared_controller_moves_target_to_a_free_one() {
        // A and B (target) both on hci0; hci1 free.
        let snapshot = Snapshot {
            controllers: vec![
                controller("hci0", vec![connected(A), connected(B)]),
                controller("hci1", vec![]),
            ],
        };
        let plan = plan(&Address::new(B), &allowed(&[A, B]), &snapshot, &reserved());
        assert_eq!(
            plan,
            AllocationPlan::NeedsConnection {
                controller: ControllerId::new("hci1"),
                disconnects: vec![(Address::new(B), ControllerId::new("hci0"))],
            }
        );
    }

    #[test]
    fn shared_controller_falls_back_to_freeing_a_duplicate() {
        // A holds hci1 and hci2; A and B (target) share hci0. No free
        // controller, so A's second holding is vacated for B.
        let snapshot = Snapshot {
            controllers: vec![
                controller("hci0", vec![connected(A), connected(B)]),
                controller("hci1", vec![connected(A)]),
                controller("hci2", vec![connected(A)]),
            ],
        };
        let plan = plan(&Address::new(B), &allowed(&[A, B]), &snapshot, &reserved());
        match plan {
            AllocationPlan::NeedsConnection {
                controller,
                disconnects,
            } => {
                // A's holdings in snapshot order are [hci0, hci1, hci2];
                // the fallback vacates the second one.
                assert_eq!(controller, ControllerId::new("hci1"));
                assert!(disconnects.contains(&(Address::new(B), ControllerId::new("hci0"))));
                assert!(disconnects.contains(&(Address::new(A), ControllerId::new("hci1"))));
            }
            other => panic!("unexpected plan: {other:?}"),
        }
    }

    #[test]
    fn target_on_multiple_controllers_keeps_the_first() {
        let snapshot = Snapshot {
            controllers: vec![
                controller("hci0", vec![connected(B)]),
                controller("hci1", vec![connected(B)]),
            ],
        };
        let plan = plan(&Address::new(B), &allowed(&[A, B]), &snapshot, &reserved());
        assert_eq!(
            plan,
            AllocationPlan::AlreadyConnected {
                controller: ControllerId::new("hci0"),
                disconnects: vec![(Address::new(B), ControllerId::new("hci1"))],
            }
        );
    }

    #[test]
    fn unrecognized_devices_are_queued_for_disconnection() {
        let snapshot = Snapshot {
            controllers: vec![
                controller("hci0", vec![connected(ROGUE)]),
                controller("hci1", vec![connected(B)]),
            ],
        };
        let plan = plan(&Address::new(B), &allowed(&[A, B]), &snapshot, &reserved());
        assert_eq!(
            plan,
            AllocationPlan::AlreadyConnected {
                controller: ControllerId::new("hci1"),
                disconnects: vec![(Address::new(ROGUE), ControllerId::new("hci0"))],
            }
        );
    }

    #[test]
    fn reserved_controller_is_never_allocated() {
        // The only idle controller is the reserved one.
        let snapshot = Snapshot {
            controllers: vec![
                controller("hci9", vec![]),
                controller("hci0", vec![connected(A)]),
            ],
        };
        let plan = plan(&Address::new(B), &allowed(&[A, B]), &snapshot, &reserved());
        assert_eq!(plan, AllocationPlan::Unavailable { disconnects: vec![] });
    }

    #[test]
    fn unconnected_target_falls_back_to_freeing_a_duplicate() {
        // A occupies both controllers; B gets A's second one.
        let snapshot = Snapshot {
            controllers: vec![
                controller("hci0", vec![connected(A)]),
                controller("hci1", vec![connected(A)]),
            ],
        };
        let plan = plan(&Address::new(B), &allowed(&[A, B]), &snapshot, &reserved());
        assert_eq!(
            plan,
            AllocationPlan::NeedsConnection {
                controller: ControllerId::new("hci1"),
                disconnects: vec![(Address::new(A), ControllerId::new("hci1"))],
            }
        );
    }
}
