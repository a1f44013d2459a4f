//! Resolve a user-supplied container reference.

use crate::CoreError;
use berth_runtime::{ContainerFilter, ContainerRecord, Supervisor};
use berth_schema::labels;

/// Containers of `namespace`, oldest first.
pub fn list_containers(
    supervisor: &dyn Supervisor,
    namespace: &str,
) -> Result<Vec<ContainerRecord>, CoreError> {
    let mut all = supervisor.containers(&ContainerFilter::label(labels::NAMESPACE, namespace))?;
    all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
    Ok(all)
}

/// Find a container by full id, name, or unique id prefix, in that order.
pub fn find_container(
    supervisor: &dyn Supervisor,
    namespace: &str,
    reference: &str,
) -> Result<ContainerRecord, CoreError> {
    if reference.is_empty() {
        return Err(CoreError::NoSuchContainer(String::new()));
    }
    let all = list_containers(supervisor, namespace)?;
    if let Some(rec) = all.iter().find(|r| r.id == reference) {
        return Ok(rec.clone());
    }
    if let Some(rec) = all
        .iter()
        .find(|r| r.labels.get(labels::NAME).is_some_and(|n| n == reference))
    {
        return Ok(rec.clone());
    }
    let mut matches = all.iter().filter(|r| r.id.starts_with(reference));
    match (matches.next(), matches.next()) {
        (Some(one), None) => Ok(one.clone()),
        (Some(_), Some(_)) => Err(CoreError::Ambiguous(reference.to_owned())),
        (None, _) => Err(CoreError::NoSuchContainer(reference.to_owned())),
    }
}

pub fn container_name(rec: &ContainerRecord) -> &str {
    rec.labels.get(labels::NAME).map_or("", String::as_str)
}

#[cfg(test)]
mod tests {
    use super::*;
    use berth_runtime::oci::default_spec;
    use berth_runtime::{MockSupervisor, NewContainer};
    use berth_schema::Labels;

    fn add(sup: &MockSupervisor, id: &str, ns: &str, name: &str) {
        let mut labels = Labels::new();
        labels.insert(labels::NAMESPACE.to_owned(), ns.to_owned());
        labels.insert(labels::NAME.to_owned(), name.to_owned());
        sup.create_container(NewContainer {
            id: id.to_owned(),
            image: "alpine".to_owned(),
            labels,
            spec: default_spec(false),
            rootfs_path: None,
        })
        .unwrap();
    }

    #[test]
    fn id_name_and_prefix() {
        let sup = MockSupervisor::new();
        add(&sup, "abc111", "default", "web");
        add(&sup, "abc222", "default", "db");
        add(&sup, "fff000", "other", "web");

        assert_eq!(find_container(&sup, "default", "abc111").unwrap().id, "abc111");
        assert_eq!(find_container(&sup, "default", "db").unwrap().id, "abc222");
        assert_eq!(find_container(&sup, "default", "abc2").unwrap().id, "abc222");
        assert_eq!(find_container(&sup, "other", "web").unwrap().id, "fff000");
        assert!(matches!(
            find_container(&sup, "default", "abc"),
            Err(CoreError::Ambiguous(_))
        ));
        let err = find_container(&sup, "default", "fff").unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn name_wins_over_prefix() {
        let sup = MockSupervisor::new();
        add(&sup, "beef01", "default", "x");
        add(&sup, "cafe01", "default", "beef");
        assert_eq!(find_container(&sup, "default", "beef").unwrap().id, "cafe01");
    }
}
