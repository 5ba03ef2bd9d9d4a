//! Working-case preparation for one stage.
use super::{display_rel, Pipeline, Stage};
use crate::config::{FieldTarget, FieldTransfer, StageConfig};
use crate::patch::{patch_file, PatchDirective};
use crate::staging;
use crate::timestep::latest_timestep;
use anyhow::{Context, Result};
use std::fs;
use std::path::PathBuf;

/// Field files carry their own name on the `object` header line.
const FIELD_OBJECT_KEY: &str = "object";

impl Pipeline {
    pub(super) fn prepare_stage(&self, stage: Stage, stage_config: &StageConfig) -> Result<()> {
        let working = self.paths.working_dir();
        let archive = self.paths.archive_dir();
        if stage_config.reset_archive {
            staging::reset_directory(&archive, true)?;
        } else if stage_config.archive.is_some() {
            fs::create_dir_all(&archive)
                .with_context(|| format!("create {}", archive.display()))?;
        }
        staging::reset_directory(&working, true)?;

        let template = self.paths.template_dir(&stage_config.template_dir);
        for seed in &stage_config.seed_dirs {
            staging::copy_tree(&template.join(seed), &working.join(seed))?;
        }
        for input in &stage_config.archive_inputs {
            staging::copy_tree(
                &self.paths.archive_entry(&input.from),
                &self.paths.working_entry(&input.to),
            )?;
        }
        if let Some(transfer) = &stage_config.field_transfer {
            let target = self.transfer_fields(transfer)?;
            tracing::debug!(stage = %stage, target = %target.display(), "fields transferred");
        }
        for (directive, strict) in self.patch_directives(stage_config) {
            let replaced = if strict {
                directive.apply_strict()?
            } else {
                directive.apply()?
            };
            if replaced == 0 {
                tracing::warn!(
                    stage = %stage,
                    file = %directive.path.display(),
                    key = %directive.key,
                    "patch key not found; file left unchanged"
                );
            }
        }
        Ok(())
    }

    /// Resolve the stage's patch specs against the config, skipping unset values.
    ///
    /// Each directive is paired with its spec's `strict` flag.
    pub(super) fn patch_directives(
        &self,
        stage_config: &StageConfig,
    ) -> Vec<(PatchDirective, bool)> {
        stage_config
            .patches
            .iter()
            .filter_map(|spec| {
                let value = self.config.patch_value(&spec.value)?;
                let path = self.paths.working_entry(&spec.file);
                let directive = PatchDirective::new(path, spec.key.clone(), value);
                Some((directive, spec.strict))
            })
            .collect()
    }

    /// Copy fields out of an archived snapshot into the working case.
    ///
    /// Renamed fields get their `object` header rewritten to the new name.
    fn transfer_fields(&self, transfer: &FieldTransfer) -> Result<PathBuf> {
        let snapshot = self.paths.archive_entry(&transfer.snapshot);
        let working = self.paths.working_dir();
        let target = match transfer.target {
            FieldTarget::Initial => working.join("0"),
            FieldTarget::NextTimestep => {
                let latest = latest_timestep(&working)?;
                working.join(latest.next_label())
            }
        };
        fs::create_dir_all(&target).with_context(|| format!("create {}", target.display()))?;

        for rename in &transfer.renames {
            let dest = target.join(&rename.to);
            staging::copy_file(&snapshot.join(&rename.from), &dest)?;
            patch_file(&dest, FIELD_OBJECT_KEY, &rename.to)?;
        }
        for field in &transfer.common {
            staging::copy_file(&snapshot.join(field), &target.join(field))?;
        }
        self.log.line(&format!(
            "Transferred {} fields from {} into {}",
            transfer.renames.len() + transfer.common.len(),
            display_rel(self.paths.root(), &snapshot),
            display_rel(self.paths.root(), &target),
        ))?;
        Ok(target)
    }
}
