use std::collections::BTreeMap;
use std::fs;
use std::process::ExitCode;

use camino::{Utf8Path, Utf8PathBuf};
use serde_json::{Value, json};

use starbreeder_sdk::cli;
use starbreeder_sdk::{Config, Module, ModuleContext, ModuleResult};

const GENOTYPE_FILE: &str = "genotype.json";

// Writes, copies and counts files. No evolutionary logic.
struct EchoModule;

impl Module for EchoModule {
    fn name(&self) -> &str {
        "starbreeder-echo"
    }

    fn initialize(
        &self,
        genotype_dirs: &BTreeMap<String, Utf8PathBuf>,
        config: &Config,
        params: Option<&Value>,
        context: &ModuleContext,
    ) -> ModuleResult<()> {
        for (key, dir) in genotype_dirs {
            context.check()?;
            let method = config
                .initialize
                .root_individuals
                .get(key)
                .map(|root| root.method.as_str())
                .unwrap_or("unknown");
            let genotype = json!({ "key": key, "method": method, "params": params });
            fs::write(dir.join(GENOTYPE_FILE), serde_json::to_vec_pretty(&genotype)?)?;
        }
        Ok(())
    }

    fn evaluate(
        &self,
        genotype_dirs: &[Utf8PathBuf],
        phenotype_dirs: &[Utf8PathBuf],
        config: &Config,
        _params: Option<&Value>,
        context: &ModuleContext,
    ) -> ModuleResult<()> {
        for (genotype, phenotype) in genotype_dirs.iter().zip(phenotype_dirs) {
            context.check()?;
            let files = count_files(genotype)?;
            for file in config.evaluate.phenotype.values() {
                fs::write(phenotype.join(&file.name), json!({ "file_count": files }).to_string())?;
            }
        }
        Ok(())
    }

    fn generate(
        &self,
        parent_dirs: &[Utf8PathBuf],
        child_dirs: &[Utf8PathBuf],
        _config: &Config,
        _params: Option<&Value>,
        context: &ModuleContext,
    ) -> ModuleResult<Vec<Vec<usize>>> {
        if parent_dirs.is_empty() && !child_dirs.is_empty() {
            return Err("cannot generate children without parents".into());
        }
        let mut parentage = Vec::with_capacity(child_dirs.len());
        for (index, child) in child_dirs.iter().enumerate() {
            context.check()?;
            let parent = index % parent_dirs.len();
            copy_tree(&parent_dirs[parent], child)?;
            parentage.push(vec![parent]);
        }
        Ok(parentage)
    }
}

fn count_files(dir: &Utf8Path) -> std::io::Result<usize> {
    let mut total = 0;
    for entry in dir.read_dir_utf8()? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            total += count_files(entry.path())?;
        } else {
            total += 1;
        }
    }
    Ok(total)
}

fn copy_tree(source: &Utf8Path, target: &Utf8Path) -> std::io::Result<()> {
    fs::create_dir_all(target)?;
    for entry in source.read_dir_utf8()? {
        let entry = entry?;
        let destination = target.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_tree(entry.path(), &destination)?;
        } else {
            fs::copy(entry.path(), &destination)?;
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    cli::run(EchoModule)
}
