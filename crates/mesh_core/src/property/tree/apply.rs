//! Applying replicated deltas to shadow properties.

use super::{NodeId, PropertyTree};
use crate::error::PropertyError;
use crate::sync::{PropertySyncCommand, PropertySyncCommandList, SyncPayload, SyncType};

impl PropertyTree {
    /// Applies one delta received from the authoritative copy.
    ///
    /// Bypasses the shadow guard and fires observers as a local mutation
    /// would; shadow properties never report onward.
    ///
    /// # Errors
    ///
    /// [`PropertyError::NodeNotFound`] when the path does not resolve, plus
    /// whatever the underlying mutator raises.
    pub fn apply_sync_command(&mut self, command: &PropertySyncCommand) -> Result<(), PropertyError> {
        let target = self.resolve_path(&command.path)?;
        let actual = self.sync_type_of(target)?;
        if actual != command.sync_type {
            return Err(PropertyError::InvalidSyncOperation {
                operation: command.operation,
                sync_type: command.sync_type,
            });
        }

        match &command.payload {
            SyncPayload::SetValue(value) => {
                let expected = self.kind_of(target)?;
                let source = self.from_wire_expected(value, &expected)?;
                self.replace_with(target, source)
            }
            SyncPayload::ListAdd(values) => {
                for value in values {
                    let child = self.from_wire(value)?;
                    self.attach_or_free(child, |tree| tree.list_add_unchecked(target, child))?;
                }
                Ok(())
            }
            SyncPayload::ListInsert { index, value } => {
                let child = self.from_wire(value)?;
                self.attach_or_free(child, |tree| tree.list_insert_unchecked(target, *index, child))
            }
            SyncPayload::ListSet(entries) => {
                for (index, value) in entries {
                    let child = self.from_wire(value)?;
                    self.attach_or_free(child, |tree| tree.list_set_unchecked(target, *index, child))?;
                }
                Ok(())
            }
            SyncPayload::ListRemove(indices) => {
                let mut indices = indices.clone();
                indices.sort_unstable();
                indices.dedup();
                for index in indices.into_iter().rev() {
                    self.list_remove_at_unchecked(target, index)?;
                }
                Ok(())
            }
            SyncPayload::DictUpdate(entries) => {
                let mut built = Vec::with_capacity(entries.len());
                for (key, value) in entries {
                    match self.from_wire(value) {
                        Ok(child) => built.push((key.clone(), child)),
                        Err(e) => {
                            for (_, child) in built {
                                self.free_subtree(child);
                            }
                            return Err(e);
                        }
                    }
                }
                self.dict_update_many_unchecked(target, built)
            }
            SyncPayload::DictRemove(keys) => {
                for key in keys {
                    self.dict_remove_unchecked(target, key)?;
                }
                Ok(())
            }
            SyncPayload::Clear => match command.sync_type {
                SyncType::List => self.list_clear_unchecked(target),
                SyncType::Dict => self.dict_clear_unchecked(target),
                SyncType::PlaintAndComposite => Err(PropertyError::InvalidSyncOperation {
                    operation: command.operation,
                    sync_type: command.sync_type,
                }),
            },
        }
    }

    /// Applies a drained batch in order, stopping at the first failure.
    pub fn apply_sync_commands(&mut self, batch: &PropertySyncCommandList) -> Result<(), PropertyError> {
        for command in &batch.commands {
            self.apply_sync_command(command)?;
        }
        Ok(())
    }

    fn replace_with(&mut self, target: NodeId, source: NodeId) -> Result<(), PropertyError> {
        self.attach_or_free(source, |tree| tree.assign_unchecked(target, source))
    }

    fn attach_or_free(
        &mut self,
        child: NodeId,
        attach: impl FnOnce(&mut Self) -> Result<(), PropertyError>,
    ) -> Result<(), PropertyError> {
        let result = attach(self);
        if result.is_err() && self.node(child).map(|n| n.parent.is_none() && n.top_owner.is_none()).unwrap_or(false) {
            self.free_subtree(child);
        }
        result
    }
}
