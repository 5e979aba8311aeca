use async_trait::async_trait;
use fleet_types::Machine;
use std::collections::HashMap;

/// Read contract against the inventory collaborator.
#[async_trait]
pub trait MachineDirectory: Send + Sync {
    /// Resolve target ids in one batched call. Ids with no matching
    /// machine are simply absent from the result; a partial miss is
    /// never an error.
    async fn resolve_by_ids(&self, ids: &[i64]) -> anyhow::Result<Vec<Machine>>;
}

/// Supplies the process-wide fallback private key. `None` or an empty
/// string means no fallback is available.
pub trait SharedKeySource: Send + Sync {
    fn shared_key(&self) -> Option<String>;
}

impl<F> SharedKeySource for F
where
    F: Fn() -> Option<String> + Send + Sync,
{
    fn shared_key(&self) -> Option<String> {
        (self)()
    }
}

/// Fixed in-memory directory, for embedding and tests.
pub struct StaticDirectory {
    machines: HashMap<i64, Machine>,
}

impl StaticDirectory {
    pub fn new(machines: impl IntoIterator<Item = Machine>) -> Self {
        Self {
            machines: machines
                .into_iter()
                .map(|machine| (machine.id, machine))
                .collect(),
        }
    }
}

#[async_trait]
impl MachineDirectory for StaticDirectory {
    async fn resolve_by_ids(&self, ids: &[i64]) -> anyhow::Result<Vec<Machine>> {
        Ok(ids
            .iter()
            .filter_map(|id| self.machines.get(id).cloned())
            .collect())
    }
}
