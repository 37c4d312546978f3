//! Loads modules from disk, instrumenting each body before it runs.

use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use exlens_asm::{assemble_with_filename, AsmError};
use exlens_ir::{instrument_with_stats, is_instrumented, IrError, Procedure};
use exlens_vm::{Exception, Namespace, Value, Vm};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

pub const LISTING_EXTENSION: &str = "exa";
pub const BINARY_EXTENSION: &str = "exb";
const PACKAGE_INIT: &str = "__init__";

#[derive(Debug, Error)]
pub enum ImportError {
    #[error("no module named '{0}'")]
    NotFound(String),
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{}: {source}", path.display())]
    Assemble {
        path: PathBuf,
        #[source]
        source: AsmError,
    },
    #[error("{}: {source}", path.display())]
    Decode {
        path: PathBuf,
        #[source]
        source: IrError,
    },
    #[error("module '{module}' failed: {exception}")]
    Execution {
        module: String,
        exception: Box<Exception>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Listing,
    Binary,
}

impl SourceKind {
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some(BINARY_EXTENSION) => SourceKind::Binary,
            _ => SourceKind::Listing,
        }
    }
}

/// A module located on a search path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleSource {
    pub name: String,
    pub path: PathBuf,
    pub kind: SourceKind,
    pub is_package: bool,
}

impl ModuleSource {
    /// Package the module belongs to; a package is its own.
    pub fn package(&self) -> String {
        if self.is_package {
            return self.name.clone();
        }
        self.name
            .rsplit_once('.')
            .map(|(parent, _)| parent.to_string())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImporterConfig {
    pub search_paths: Vec<PathBuf>,
    /// Instrument bodies that are not instrumented yet.
    pub instrument: bool,
}

impl Default for ImporterConfig {
    fn default() -> Self {
        Self {
            search_paths: vec![PathBuf::from(".")],
            instrument: true,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ModuleImporter {
    config: ImporterConfig,
}

impl ModuleImporter {
    pub fn new(config: ImporterConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ImporterConfig {
        &self.config
    }

    pub fn add_search_path(&mut self, path: impl Into<PathBuf>) {
        self.config.search_paths.push(path.into());
    }

    /// Resolves a dotted module name against the search paths, in order.
    ///
    /// A directory with an `__init__` body is a package; otherwise a listing
    /// wins over a binary of the same name.
    pub fn find_module(&self, name: &str) -> Option<ModuleSource> {
        let relative: PathBuf = name.split('.').collect();
        for base in &self.config.search_paths {
            let dir = base.join(&relative);
            if dir.is_dir() {
                for (ext, kind) in [
                    (BINARY_EXTENSION, SourceKind::Binary),
                    (LISTING_EXTENSION, SourceKind::Listing),
                ] {
                    let init = dir.join(format!("{PACKAGE_INIT}.{ext}"));
                    if init.is_file() {
                        return Some(ModuleSource {
                            name: name.to_string(),
                            path: init,
                            kind,
                            is_package: true,
                        });
                    }
                }
            }
            for (ext, kind) in [
                (LISTING_EXTENSION, SourceKind::Listing),
                (BINARY_EXTENSION, SourceKind::Binary),
            ] {
                let file = dir.with_extension(ext);
                if file.is_file() {
                    return Some(ModuleSource {
                        name: name.to_string(),
                        path: file,
                        kind,
                        is_package: false,
                    });
                }
            }
        }
        None
    }

    /// Reads a module body and instruments it when configured to.
    pub fn load_procedure(&self, source: &ModuleSource) -> Result<Procedure, ImportError> {
        let procedure = match source.kind {
            SourceKind::Listing => {
                let text = fs::read_to_string(&source.path).map_err(|err| ImportError::Io {
                    path: source.path.clone(),
                    source: err,
                })?;
                let filename = source.path.display().to_string();
                assemble_with_filename(&text, Some(&filename)).map_err(|err| {
                    ImportError::Assemble {
                        path: source.path.clone(),
                        source: err,
                    }
                })?
            }
            SourceKind::Binary => {
                let bytes = fs::read(&source.path).map_err(|err| ImportError::Io {
                    path: source.path.clone(),
                    source: err,
                })?;
                Procedure::from_bytes(&bytes).map_err(|err| ImportError::Decode {
                    path: source.path.clone(),
                    source: err,
                })?
            }
        };
        if !self.config.instrument || is_instrumented(&procedure) {
            return Ok(procedure);
        }
        let (procedure, stats) = instrument_with_stats(procedure);
        debug!(
            module = %source.name,
            guarded = stats.total(),
            nested = stats.nested,
            "instrumented module"
        );
        Ok(procedure)
    }

    /// Imports `name`, its parent packages first. Re-importing returns the
    /// registered namespace.
    pub fn import(&self, vm: &mut Vm, name: &str) -> Result<Rc<Namespace>, ImportError> {
        if let Some(namespace) = vm.module(name) {
            return Ok(namespace);
        }
        if let Some((parent, _)) = name.rsplit_once('.') {
            self.import(vm, parent)?;
        }
        let source = self
            .find_module(name)
            .ok_or_else(|| ImportError::NotFound(name.to_string()))?;
        self.load(vm, &source)
    }

    /// Imports a file directly, named after its stem.
    pub fn import_path(&self, vm: &mut Vm, path: &Path) -> Result<Rc<Namespace>, ImportError> {
        let name = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .ok_or_else(|| ImportError::NotFound(path.display().to_string()))?
            .to_string();
        if let Some(namespace) = vm.module(&name) {
            return Ok(namespace);
        }
        let source = ModuleSource {
            name,
            path: path.to_path_buf(),
            kind: SourceKind::from_path(path),
            is_package: false,
        };
        self.load(vm, &source)
    }

    fn load(&self, vm: &mut Vm, source: &ModuleSource) -> Result<Rc<Namespace>, ImportError> {
        let procedure = self.load_procedure(source)?;
        let namespace = vm.new_namespace(&source.name, Some(source.path.display().to_string()));
        namespace.set("__package__", Value::from(source.package()));
        if source.is_package {
            if let Some(dir) = source.path.parent() {
                namespace.set(
                    "__path__",
                    Value::list(vec![Value::from(dir.display().to_string())]),
                );
            }
        }
        debug!(module = %source.name, path = %source.path.display(), "loading module");
        vm.register_module(&source.name, namespace.clone());
        if let Err(exception) = vm.exec_module(&procedure, &namespace) {
            vm.remove_module(&source.name);
            return Err(ImportError::Execution {
                module: source.name.clone(),
                exception: Box::new(exception),
            });
        }
        Ok(namespace)
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::Path;
    use std::rc::Rc;

    use exlens_asm::assemble;
    use exlens_ir::{instrument, Op};
    use exlens_vm::{scratch, ExcKind, Exception, Namespace, Value, Vm};
    use tempfile::TempDir;

    use super::{ImportError, ImporterConfig, ModuleImporter, SourceKind};
    use crate::wrap;

    const FOO_DATA: &str = r#"
proc <module>
  LOAD_CONST proc __init__ params=self
    LOAD_CONST 'Foo'
    LOAD_FAST self
    STORE_ATTR name
    LOAD_CONST None
    RETURN_VALUE
  end
  MAKE_FUNCTION
  STORE_NAME __init__
  LOAD_CONST '__init__'
  LOAD_NAME __init__
  BUILD_MAP 1
  BUILD_CLASS Foo
  STORE_NAME Foo

  LOAD_CONST proc subscr_binary
    BUILD_LIST 0
    STORE_FAST a
    LOAD_FAST a
    LOAD_CONST 0
    BINARY_SUBSCR
    RETURN_VALUE
  end
  MAKE_FUNCTION
  STORE_NAME subscr_binary

  LOAD_CONST proc subscr_store
    BUILD_LIST 0
    STORE_FAST a
    LOAD_CONST 1
    LOAD_FAST a
    LOAD_CONST 0
    STORE_SUBSCR
    LOAD_CONST None
    RETURN_VALUE
  end
  MAKE_FUNCTION
  STORE_NAME subscr_store

  LOAD_CONST proc subscr_delete
    BUILD_LIST 0
    STORE_FAST a
    LOAD_FAST a
    LOAD_CONST 0
    DELETE_SUBSCR
    LOAD_CONST None
    RETURN_VALUE
  end
  MAKE_FUNCTION
  STORE_NAME subscr_delete

  LOAD_CONST proc attr_load
    LOAD_GLOBAL Foo
    CALL_FUNCTION 0
    STORE_FAST o
    LOAD_FAST o
    LOAD_ATTR names
    RETURN_VALUE
  end
  MAKE_FUNCTION
  STORE_NAME attr_load

  LOAD_CONST proc attr_store
    LOAD_GLOBAL object
    CALL_FUNCTION 0
    STORE_FAST o
    LOAD_CONST 'bla'
    LOAD_FAST o
    STORE_ATTR name
    LOAD_CONST None
    RETURN_VALUE
  end
  MAKE_FUNCTION
  STORE_NAME attr_store

  LOAD_CONST proc attr_delete
    LOAD_GLOBAL Foo
    CALL_FUNCTION 0
    STORE_FAST o
    LOAD_FAST o
    DELETE_ATTR names
    LOAD_CONST None
    RETURN_VALUE
  end
  MAKE_FUNCTION
  STORE_NAME attr_delete
  LOAD_CONST None
  RETURN_VALUE
end
"#;

    fn write(dir: &Path, relative: &str, contents: &[u8]) {
        let path = dir.join(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("create dirs");
        }
        fs::write(path, contents).expect("write module");
    }

    fn importer(dir: &TempDir) -> ModuleImporter {
        ModuleImporter::new(ImporterConfig {
            search_paths: vec![dir.path().to_path_buf()],
            instrument: true,
        })
    }

    fn fail(vm: &mut Vm, namespace: &Namespace, name: &str) -> Exception {
        let wrapped = wrap(namespace.get(name).expect("function defined"));
        vm.call(&wrapped, Vec::new()).expect_err("call should fail")
    }

    #[test]
    fn imported_modules_report_failing_operands() {
        scratch::reset();
        let dir = TempDir::new().expect("tempdir");
        write(dir.path(), "foo_data.exa", FOO_DATA.as_bytes());
        let mut vm = Vm::new();
        let ns = importer(&dir).import(&mut vm, "foo_data").expect("import");

        for name in ["subscr_binary", "subscr_store", "subscr_delete"] {
            let err = fail(&mut vm, &ns, name);
            assert_eq!(err.kind, ExcKind::IndexError, "{name}");
            assert!(
                err.message()
                    .contains("Debug info:\n\tObject: []\n\tObject len: 0\n\tIndex: 0"),
                "{name}: {}",
                err.message()
            );
        }

        for name in ["attr_load", "attr_delete"] {
            let err = fail(&mut vm, &ns, name);
            assert_eq!(err.kind, ExcKind::AttributeError, "{name}");
            let message = err.message();
            assert!(message.contains("Did you mean 'name'?"), "{name}: {message}");
            assert!(
                message.contains("\n\tType: <class 'foo_data.Foo'>\n\tAttributes: "),
                "{name}: {message}"
            );
        }

        let err = fail(&mut vm, &ns, "attr_store");
        assert!(err
            .message()
            .contains("\n\tType: <class 'object'>\n\tAttributes: "));
        assert!(!scratch::is_set(ns.id));
    }

    #[test]
    fn module_globals_describe_their_origin() {
        let dir = TempDir::new().expect("tempdir");
        write(dir.path(), "foo_data.exa", FOO_DATA.as_bytes());
        let mut vm = Vm::new();
        let ns = importer(&dir).import(&mut vm, "foo_data").expect("import");
        assert_eq!(ns.get("__name__"), Some(Value::from("foo_data")));
        assert_eq!(ns.get("__package__"), Some(Value::from("")));
        let file = ns.get("__file__").expect("__file__").to_string();
        assert!(file.ends_with("foo_data.exa"));
        assert!(ns.get("__path__").is_none());

        let err = fail(&mut vm, &ns, "subscr_binary");
        let frame = &err.traceback[0];
        assert_eq!(frame.filename.as_deref(), Some(file.as_str()));
    }

    #[test]
    fn reimport_returns_the_registered_namespace() {
        let dir = TempDir::new().expect("tempdir");
        write(dir.path(), "foo_data.exa", FOO_DATA.as_bytes());
        let importer = importer(&dir);
        let mut vm = Vm::new();
        let first = importer.import(&mut vm, "foo_data").expect("import");
        let second = importer.import(&mut vm, "foo_data").expect("import");
        assert!(Rc::ptr_eq(&first, &second));
        assert!(vm.module("foo_data").is_some());
    }

    #[test]
    fn packages_import_parents_first() {
        let dir = TempDir::new().expect("tempdir");
        write(
            dir.path(),
            "pkg/__init__.exa",
            b"proc <module>\n  LOAD_CONST 42\n  STORE_NAME answer\nend\n",
        );
        write(
            dir.path(),
            "pkg/util.exa",
            b"proc <module>\n  LOAD_CONST 'u'\n  STORE_NAME tag\nend\n",
        );
        let mut vm = Vm::new();
        let util = importer(&dir).import(&mut vm, "pkg.util").expect("import");
        assert_eq!(util.get("tag"), Some(Value::from("u")));
        assert_eq!(util.get("__package__"), Some(Value::from("pkg")));

        let pkg = vm.module("pkg").expect("parent imported");
        assert_eq!(pkg.get("answer"), Some(Value::Int(42)));
        assert_eq!(pkg.get("__package__"), Some(Value::from("pkg")));
        assert!(pkg.get("__path__").is_some());
    }

    #[test]
    fn binary_modules_are_not_instrumented_twice() {
        let dir = TempDir::new().expect("tempdir");
        let procedure = instrument(assemble(FOO_DATA).expect("assemble"));
        write(
            dir.path(),
            "foo_bin.exb",
            &procedure.to_bytes().expect("encode"),
        );
        write(dir.path(), "foo_data.exa", FOO_DATA.as_bytes());
        let importer = importer(&dir);

        let binary = importer.find_module("foo_bin").expect("found");
        assert_eq!(binary.kind, SourceKind::Binary);
        let listing = importer.find_module("foo_data").expect("found");
        assert_eq!(listing.kind, SourceKind::Listing);

        let scratch_ops = |procedure: &exlens_ir::Procedure| {
            procedure
                .nested()
                .map(|nested| nested.count_ops(&|op| matches!(op, Op::StoreScratch(_))))
                .sum::<usize>()
        };
        let from_binary = importer.load_procedure(&binary).expect("load");
        let from_listing = importer.load_procedure(&listing).expect("load");
        assert_eq!(scratch_ops(&from_binary), scratch_ops(&from_listing));
        assert!(scratch_ops(&from_binary) > 0);

        let mut vm = Vm::new();
        let ns = importer.import(&mut vm, "foo_bin").expect("import");
        let err = fail(&mut vm, &ns, "subscr_binary");
        assert!(err.message().contains("Object len: 0"));
    }

    #[test]
    fn import_failures_are_reported() {
        let dir = TempDir::new().expect("tempdir");
        write(dir.path(), "broken.exa", b"proc <module>\n  NOT_AN_OP\nend\n");
        write(
            dir.path(),
            "raises.exa",
            b"proc <module>\n  LOAD_CONST 'boom'\n  RAISE ValueError\nend\n",
        );
        let importer = importer(&dir);
        let mut vm = Vm::new();

        let err = importer.import(&mut vm, "missing").expect_err("not found");
        assert!(matches!(err, ImportError::NotFound(ref name) if name == "missing"));
        assert_eq!(err.to_string(), "no module named 'missing'");

        let err = importer.import(&mut vm, "broken").expect_err("bad listing");
        assert!(matches!(err, ImportError::Assemble { .. }));

        let err = importer.import(&mut vm, "raises").expect_err("raises");
        match err {
            ImportError::Execution { module, exception } => {
                assert_eq!(module, "raises");
                assert_eq!(exception.to_string(), "ValueError: boom");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(vm.module("raises").is_none());

        let err = importer.import(&mut vm, "pkg.missing").expect_err("no parent");
        assert_eq!(err.to_string(), "no module named 'pkg'");
    }

    #[test]
    fn files_can_be_imported_by_path() {
        let dir = TempDir::new().expect("tempdir");
        write(dir.path(), "foo_data.exa", FOO_DATA.as_bytes());
        let importer = ModuleImporter::default();
        let mut vm = Vm::new();
        let ns = importer
            .import_path(&mut vm, &dir.path().join("foo_data.exa"))
            .expect("import");
        assert!(ns.get("Foo").is_some());
        assert!(vm.module("foo_data").is_some());
    }
}
