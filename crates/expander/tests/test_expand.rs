#![allow(clippy::disallowed_methods)]

use std::{
    collections::BTreeSet,
    fs,
    path::{Path, PathBuf},
    process::Command,
};

use anyhow::Result;
use expander::{
    EmbedSpec, ExpandError, Expander,
    config::Config,
    graph::ModuleRecord,
    payload::PayloadBuilder,
};
use indexmap::IndexMap;
use insta::assert_snapshot;
use pretty_assertions::assert_eq;
use ruff_python_ast::{Expr, Stmt};
use ruff_python_parser::parse_module;
use tempfile::TempDir;

fn create_test_file(path: &Path, content: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, content)?;
    Ok(())
}

/// `app/` holds the entry file, `site/` plays the installed packages.
struct Fixture {
    temp_dir: TempDir,
}

impl Fixture {
    fn new() -> Result<Self> {
        Ok(Self {
            temp_dir: TempDir::new()?,
        })
    }

    fn entry(&self, content: &str) -> Result<PathBuf> {
        let path = self.temp_dir.path().join("app/main.py");
        create_test_file(&path, content)?;
        Ok(path)
    }

    fn site(&self) -> PathBuf {
        self.temp_dir.path().join("site")
    }

    fn installed(&self, relative: &str, content: &str) -> Result<()> {
        create_test_file(&self.site().join(relative), content)
    }

    fn expander(&self) -> Expander {
        let config = Config {
            site_packages: vec![self.site()],
            ..Config::default()
        };
        Expander::new(config).with_environment(Some(""), Some(""), Some(""))
    }
}

/// Every `code = """..."""` value in the guard block, dedented the way
/// the block dedents it at runtime.
fn embedded_sources(text: &str) -> Vec<String> {
    let parsed = parse_module(text).expect("expanded program should parse");
    parsed
        .syntax()
        .body
        .iter()
        .filter_map(|stmt| match stmt {
            Stmt::If(guard) => Some(&guard.body),
            _ => None,
        })
        .flatten()
        .filter_map(|stmt| match stmt {
            Stmt::Assign(assign) => Some(assign),
            _ => None,
        })
        .filter(|assign| {
            matches!(assign.targets.as_slice(), [Expr::Name(name)] if name.id.as_str() == "code")
        })
        .filter_map(|assign| match &*assign.value {
            Expr::StringLiteral(literal) => Some(dedent(literal.value.to_str())),
            _ => None,
        })
        .collect()
}

fn dedent(code: &str) -> String {
    code.split_inclusive('\n')
        .map(|line| line.strip_prefix("    ").unwrap_or(line))
        .collect()
}

#[test]
fn test_empty_embed_set_is_byte_identical() -> Result<()> {
    let fixture = Fixture::new()?;
    let text = "from __future__ import annotations\r\nimport foo\nprint(foo.X)";
    let entry = fixture.entry(text)?;
    fixture.installed("foo.py", "X = 1\n")?;

    let expansion = fixture.expander().expand(&entry, &EmbedSpec::default())?;
    assert_eq!(expansion.text, text);
    Ok(())
}

#[test]
fn test_plain_source_after_future_import() -> Result<()> {
    let fixture = Fixture::new()?;
    let entry = fixture.entry("from __future__ import annotations\nimport foo\n")?;
    fixture.installed("foo.py", "print(1)\n")?;

    let expansion = fixture.expander().expand(&entry, &EmbedSpec::new(["foo"]))?;
    assert_eq!(expansion.bundled, BTreeSet::from(["foo".to_owned()]));
    assert!(!expansion.needs_build_step);
    assert_snapshot!(expansion.text, @r#"
    from __future__ import annotations

    import sys

    if sys.argv[-1] == "ONLINE_JUDGE":
        import textwrap
        import pathlib

        file = pathlib.Path("foo.py")
        file.parent.mkdir(parents=True, exist_ok=True)
        code = """\
        print(1)
        """
        file.write_text(textwrap.dedent(code))

    import foo
    "#);

    let lines: Vec<&str> = expansion.text.lines().collect();
    assert_eq!(lines[0], "from __future__ import annotations");
    assert_eq!(lines[1], "");
    assert!(parse_module(&expansion.text).is_ok());
    Ok(())
}

#[test]
fn test_no_embeddable_imports_is_identity() -> Result<()> {
    let fixture = Fixture::new()?;
    let text = "import os\n\nprint(os.sep)\n";
    let entry = fixture.entry(text)?;
    fixture.installed("foo.py", "X = 1\n")?;

    let expansion = fixture.expander().expand(&entry, &EmbedSpec::new(["foo"]))?;
    assert_eq!(expansion.text, text);
    assert!(!expansion.text.contains("package information"));
    Ok(())
}

#[test]
fn test_footer_only_for_packages_with_metadata() -> Result<()> {
    let fixture = Fixture::new()?;
    let entry = fixture.entry("import alpha\nimport beta\n")?;
    fixture.installed("alpha/__init__.py", "from .core import VALUE\n")?;
    fixture.installed("alpha/core.py", "VALUE = 42\n")?;
    fixture.installed(
        "alpha-1.0.dist-info/METADATA",
        "Metadata-Version: 2.1\nName: alpha\nVersion: 1.0\nLicense: MIT\n",
    )?;
    fixture.installed("alpha-1.0.dist-info/top_level.txt", "alpha\n")?;
    fixture.installed("alpha-1.0.dist-info/LICENSE", "MIT License\n")?;
    fixture.installed("beta.py", "B = 2\n")?;

    let expansion = fixture
        .expander()
        .expand(&entry, &EmbedSpec::new(["alpha", "beta"]))?;

    let separator = format!("# {}\n", "-".repeat(77));
    let footer = format!(
        "\n\n# package information\n{separator}# alpha\n#   Version  : 1.0\n#   License  : MIT\n#\n#   MIT License\n{separator}"
    );
    assert!(expansion.text.ends_with(&footer), "{}", expansion.text);
    assert!(!expansion.text.contains("# beta\n"));
    assert!(expansion.text.contains("pathlib.Path(\"alpha/core.py\")"));
    assert!(expansion.text.contains("pathlib.Path(\"beta.py\")"));
    Ok(())
}

#[test]
fn test_compiled_extension_is_rebuilt_from_source() -> Result<()> {
    let fixture = Fixture::new()?;
    let entry = fixture.entry("from acl import fast\n")?;
    fixture.installed("acl/__init__.py", "")?;
    fixture.installed("acl/fast.cpython-311-x86_64-linux-gnu.so", "")?;
    fixture.installed("acl/fast.pyx", "cpdef int twice(int x):\n    return 2 * x\n")?;

    let expansion = fixture.expander().expand(&entry, &EmbedSpec::new(["acl"]))?;
    assert!(expansion.needs_build_step);
    assert!(expansion.text.contains("pathlib.Path(\"acl/fast.pyx\")"));
    assert!(expansion.text.contains("    from Cython.Build import cythonize\n"));
    assert_eq!(expansion.text.matches("script_args=[\"build_ext\", \"--inplace\"]").count(), 1);
    assert!(parse_module(&expansion.text).is_ok());
    Ok(())
}

#[test]
fn test_missing_extension_source_aborts() -> Result<()> {
    let fixture = Fixture::new()?;
    let entry = fixture.entry("from acl import fast\n")?;
    fixture.installed("acl/__init__.py", "")?;
    fixture.installed("acl/fast.cpython-311-x86_64-linux-gnu.so", "")?;

    let err = fixture
        .expander()
        .expand(&entry, &EmbedSpec::new(["acl"]))
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<ExpandError>(),
        Some(ExpandError::UnreconstructableArtifact { module, .. }) if module == "acl.fast"
    ));
    Ok(())
}

#[test]
fn test_ambiguous_site_path_is_reported() {
    let mut records = IndexMap::new();
    records.insert(
        "renamed".to_owned(),
        ModuleRecord::new("renamed", Some(PathBuf::from("/proj/.venv/site/foo.py"))),
    );
    let roots = [PathBuf::from("/proj"), PathBuf::from("/proj/.venv/site")];

    let err = PayloadBuilder::new(".pyx")
        .build(&records, &EmbedSpec::new(["renamed"]), &roots)
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<ExpandError>(),
        Some(ExpandError::AmbiguousPath { roots, .. }) if roots.len() == 2
    ));
}

#[test]
fn test_tricky_literals_survive_embedding() -> Result<()> {
    let fixture = Fixture::new()?;
    let entry = fixture.entry("import tricky\n")?;
    let tricky = r##""""Docstring with \n and \""" inside."""
PATTERN = r'\d+\\'
QUOTES = '""""'
LAST = """##;
    fixture.installed("tricky.py", tricky)?;

    let expansion = fixture.expander().expand(&entry, &EmbedSpec::new(["tricky"]))?;
    assert_eq!(embedded_sources(&expansion.text), vec![tricky.to_owned()]);
    Ok(())
}

#[test]
fn test_carriage_returns_survive_embedding() -> Result<()> {
    let fixture = Fixture::new()?;
    let entry = fixture.entry("import crlf\n")?;
    let crlf = "x = \"a\rb\"\r\nif x:\r\n    y = 1\r\n";
    fixture.installed("crlf.py", crlf)?;

    let expansion = fixture.expander().expand(&entry, &EmbedSpec::new(["crlf"]))?;
    assert!(!expansion.text.contains('\r'));
    assert_eq!(embedded_sources(&expansion.text), vec![crlf.to_owned()]);
    Ok(())
}

#[test]
fn test_packages_on_interpreter_path_are_embedded() -> Result<()> {
    let fixture = Fixture::new()?;
    let entry = fixture.entry("from atcoder.dsu import DSU\n")?;
    fixture.installed("atcoder/__init__.py", "")?;
    fixture.installed("atcoder/dsu.py", "class DSU:\n    pass\n")?;

    let listing = format!("{}\n", fixture.site().display());
    let expansion = Expander::new(Config::default())
        .with_environment(Some(""), Some(""), Some(&listing))
        .expand(&entry, &EmbedSpec::new(["atcoder"]))?;
    assert_eq!(expansion.bundled, BTreeSet::from(["atcoder".to_owned()]));
    assert!(expansion.text.contains("pathlib.Path(\"atcoder/dsu.py\")"));
    Ok(())
}

#[test]
fn test_expanding_twice_is_a_no_op() -> Result<()> {
    let fixture = Fixture::new()?;
    let entry = fixture.entry("import foo\n")?;
    fixture.installed("foo.py", "X = 1\n")?;

    let expander = fixture.expander();
    let embed = EmbedSpec::new(["foo"]);
    let first = expander.expand(&entry, &embed)?;
    fs::write(&entry, &first.text)?;

    let second = expander.expand(&entry, &embed)?;
    assert_eq!(second.text, first.text);
    assert!(second.bundled.is_empty());
    Ok(())
}

fn expander_command(fixture: &Fixture) -> Command {
    let mut command = Command::new(env!("CARGO_BIN_EXE_expander"));
    command
        .current_dir(fixture.temp_dir.path())
        .env("HOME", fixture.temp_dir.path())
        .env("XDG_CONFIG_HOME", fixture.temp_dir.path().join("config"))
        .env("PYTHONPATH", "")
        .env("VIRTUAL_ENV", "")
        .env("EXPANDER_PYTHON", "")
        .env_remove("EXPANDER_MARKER")
        .env_remove("EXPANDER_PYTHON_VERSION")
        .env_remove("RUST_LOG");
    command
}

#[test]
fn test_cli_writes_output_file() -> Result<()> {
    let fixture = Fixture::new()?;
    let entry = fixture.entry("import foo\n")?;
    fixture.installed("foo.py", "print(1)\n")?;
    let output = fixture.temp_dir.path().join("out/submission.py");
    fs::create_dir_all(output.parent().unwrap_or(Path::new(".")))?;

    let status = expander_command(&fixture)
        .arg(&entry)
        .args(["-m", "foo", "--marker", "JUDGE"])
        .arg("--site-packages")
        .arg(fixture.site())
        .arg("-o")
        .arg(&output)
        .status()?;

    assert!(status.success());
    let written = fs::read_to_string(&output)?;
    assert!(written.contains("if sys.argv[-1] == \"JUDGE\":\n"));
    assert!(written.ends_with("import foo\n"));
    Ok(())
}

#[cfg(unix)]
#[test]
fn test_cli_output_permissions() -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let fixture = Fixture::new()?;
    let entry = fixture.entry("import foo\n")?;
    fixture.installed("foo.py", "print(1)\n")?;
    let mode = |path: &Path| -> Result<u32> { Ok(fs::metadata(path)?.permissions().mode() & 0o777) };

    // A new file gets the same mode as any file created under the umask
    let reference = fixture.temp_dir.path().join("reference.py");
    fs::write(&reference, "")?;
    let fresh = fixture.temp_dir.path().join("fresh.py");
    let status = expander_command(&fixture)
        .arg(&entry)
        .args(["-m", "foo", "--site-packages"])
        .arg(fixture.site())
        .arg("-o")
        .arg(&fresh)
        .status()?;
    assert!(status.success());
    assert_eq!(mode(&fresh)?, mode(&reference)?);

    let existing = fixture.temp_dir.path().join("existing.py");
    fs::write(&existing, "stale\n")?;
    fs::set_permissions(&existing, fs::Permissions::from_mode(0o750))?;
    let status = expander_command(&fixture)
        .arg(&entry)
        .args(["-m", "foo", "--site-packages"])
        .arg(fixture.site())
        .arg("-o")
        .arg(&existing)
        .status()?;
    assert!(status.success());
    assert_eq!(mode(&existing)?, 0o750);
    assert!(fs::read_to_string(&existing)?.contains("pathlib.Path(\"foo.py\")"));
    Ok(())
}

#[test]
fn test_cli_failure_leaves_no_output() -> Result<()> {
    let fixture = Fixture::new()?;
    let entry = fixture.entry("from acl import fast\n")?;
    fixture.installed("acl/__init__.py", "")?;
    fixture.installed("acl/fast.abi3.so", "")?;
    let output = fixture.temp_dir.path().join("submission.py");

    let result = expander_command(&fixture)
        .arg(&entry)
        .args(["-m", "acl"])
        .arg("--site-packages")
        .arg(fixture.site())
        .arg("-o")
        .arg(&output)
        .output()?;

    assert_eq!(result.status.code(), Some(1));
    assert!(!output.exists());
    assert!(String::from_utf8_lossy(&result.stderr).contains("cannot reconstruct `acl.fast`"));
    Ok(())
}

#[test]
fn test_cli_lists_modules() -> Result<()> {
    let fixture = Fixture::new()?;
    let entry = fixture.entry("import foo\nimport networkx\nimport nowhere\n")?;
    fixture.installed("foo.py", "import os\n")?;

    let result = expander_command(&fixture)
        .arg(&entry)
        .arg("--list-modules")
        .arg("--site-packages")
        .arg(fixture.site())
        .output()?;

    assert!(result.status.success());
    let stdout = String::from_utf8(result.stdout)?;
    let kinds: Vec<(&str, &str)> = stdout
        .lines()
        .filter_map(|line| {
            let mut fields = line.split('\t');
            Some((fields.next()?, fields.next()?))
        })
        .collect();
    assert_eq!(
        kinds,
        [
            ("__main__", "source"),
            ("foo", "source"),
            ("os", "unresolved"),
            ("networkx", "excluded"),
            ("nowhere", "missing"),
        ]
    );
    Ok(())
}
