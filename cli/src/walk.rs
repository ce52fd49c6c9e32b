use std::path::{Path, PathBuf};

use anyhow::Context;
use walkdir::WalkDir;

/// Walks the files in a directory, calling a given function for each file.
///
/// ```text
/// let mut walker = Walker::path(".");
///
/// walker.walk(
///     // This function is called for each file.
///     |file_path| {
///         // ... do something with the file
///         Ok(())
///     },
///     // This function is called with any error found during the walk.
///     |err| {
///         Ok(())
///     }
/// ).unwrap();
/// ```
pub struct Walker<'a> {
    /// Path to the directory that will be walked.
    path: &'a Path,
    /// The maximum recursion depth. 0 means that only the files directly
    /// contained in `path` are walked.
    max_depth: usize,
}

impl<'a> Walker<'a> {
    /// Creates a [`Walker`] that walks a directory.
    ///
    /// `path` can also point to an individual file instead of a directory.
    pub fn path(path: &'a Path) -> Self {
        Self { path, max_depth: 0 }
    }

    /// Sets a maximum depth while traversing the directory tree.
    ///
    /// When the maximum depth is 0 only the files that reside in the given
    /// directory are processed, subdirectories are not processed.
    pub fn max_depth(&mut self, n: usize) -> &mut Self {
        self.max_depth = n;
        self
    }

    /// Walks the directory, calling `f` for every file. Files are visited
    /// in file name order.
    ///
    /// The `e` function is called with any error that occurs during the walk,
    /// including errors returned by `f` itself. `e` must return `Ok(())` for
    /// continuing the walk or `Err` for aborting.
    pub fn walk<F, E>(self, mut f: F, mut e: E) -> anyhow::Result<()>
    where
        F: FnMut(&Path) -> anyhow::Result<()>,
        E: FnMut(anyhow::Error) -> anyhow::Result<()>,
    {
        let metadata = match self
            .path
            .metadata()
            .with_context(|| format!("can't open `{}`", self.path.display()))
        {
            Ok(metadata) => metadata,
            Err(err) => return e(err),
        };

        if metadata.is_file() {
            if let Err(err) = f(self.path) {
                return e(err);
            }
            return Ok(());
        }

        let walker = WalkDir::new(self.path)
            .min_depth(1)
            .max_depth(self.max_depth.saturating_add(1))
            .sort_by_file_name();

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    e(err.into())?;
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            if let Err(err) = f(entry.path()) {
                e(err)?
            }
        }

        Ok(())
    }

    /// Returns the paths of every file found by [`Walker::walk`], reporting
    /// errors to `e`.
    pub fn collect<E>(self, e: E) -> anyhow::Result<Vec<PathBuf>>
    where
        E: FnMut(anyhow::Error) -> anyhow::Result<()>,
    {
        let mut files = Vec::new();
        self.walk(
            |path| {
                files.push(path.to_path_buf());
                Ok(())
            },
            e,
        )?;
        Ok(files)
    }
}
