use super::{ComposeError, ServiceConfig};
use std::collections::{BTreeMap, BTreeSet};

/// Topologically sort services by `depends_on`. Ties are broken by name so
/// the order is stable across runs.
pub fn dependency_order(services: &[ServiceConfig]) -> Result<Vec<String>, ComposeError> {
    let mut pending: BTreeMap<&str, BTreeSet<String>> = services
        .iter()
        .map(|s| {
            let deps = s
                .dependencies()
                .into_iter()
                .filter(|d| services.iter().any(|o| &o.name == d))
                .collect();
            (s.name.as_str(), deps)
        })
        .collect();

    let mut order = Vec::with_capacity(services.len());
    while !pending.is_empty() {
        let ready: Vec<&str> = pending
            .iter()
            .filter(|(_, deps)| deps.is_empty())
            .map(|(name, _)| *name)
            .collect();
        if ready.is_empty() {
            let stuck = pending.keys().next().copied().unwrap_or_default();
            return Err(ComposeError::Cycle(stuck.to_owned()));
        }
        for name in ready {
            pending.remove(name);
            for deps in pending.values_mut() {
                deps.remove(name);
            }
            order.push(name.to_owned());
        }
    }
    Ok(order)
}

/// The order in which services are torn down.
pub fn reverse_dependency_order(services: &[ServiceConfig]) -> Result<Vec<String>, ComposeError> {
    let mut order = dependency_order(services)?;
    order.reverse();
    Ok(order)
}
