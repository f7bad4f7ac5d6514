use clap::Parser;
use std::path::{Path, PathBuf};

#[derive(Debug, Parser)]
#[command(name = "unlk", version)]
pub struct Args {
    /// Source tree (two-argument form) or ROM image (one-argument form).
    #[arg(value_name = "SRC_OR_ROM")]
    pub first: String,

    /// ROM image, when a source tree is given first.
    #[arg(value_name = "ROM")]
    pub second: Option<String>,

    #[arg(long, short = 'v')]
    pub verbose: bool,

    /// Build every object but write nothing, even for WRITEOUT files.
    #[arg(long = "dry-run", short = 'n')]
    pub dry_run: bool,

    /// Enables a feature-gate flag named in FILE directives. Repeatable.
    #[arg(long = "feature", value_name = "NAME")]
    pub features: Vec<String>,
}

impl Args {
    #[must_use]
    pub fn rom_path(&self) -> &Path {
        Path::new(self.second.as_deref().unwrap_or(&self.first))
    }

    #[must_use]
    pub fn src_root(&self) -> Option<&Path> {
        self.second.as_deref().map(|_| Path::new(self.first.as_str()))
    }

    /// Output paths resolve against the source tree when one is given, else
    /// against the ROM's directory.
    #[must_use]
    pub fn out_root(&self) -> PathBuf {
        match self.src_root() {
            Some(src) => src.to_path_buf(),
            None => self
                .rom_path()
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .map_or_else(|| PathBuf::from("."), Path::to_path_buf),
        }
    }

    /// The annotation file sits beside the ROM as `<rom>-info.txt`.
    #[must_use]
    pub fn annotation_path(&self) -> PathBuf {
        let mut name = self.rom_path().as_os_str().to_os_string();
        name.push("-info.txt");
        PathBuf::from(name)
    }
}
