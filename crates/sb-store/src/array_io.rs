//! Versioned plain-text format for numeric arrays.
//!
//! Every file starts with a header such as `# stepbbo-array v1 shape=3x2`
//! (matrix) or `# stepbbo-array v1 shape=4` (vector, one value per line).
//! Values use Rust's shortest round-trip exponent formatting, so reading a
//! file back yields bit-identical values. Headerless files, e.g. written by
//! numpy's `savetxt`, are accepted and their shape is inferred.

use nalgebra::{DMatrix, DVector};
use sb_types::StorageError;
use std::fmt::Write as _;
use std::path::Path;

use crate::atomic::write_atomic;

pub const ARRAY_FORMAT_VERSION: u32 = 1;
const HEADER_TAG: &str = "stepbbo-array";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Shape {
    Vector(usize),
    Matrix(usize, usize),
}

pub fn format_vector(vector: &DVector<f64>) -> String {
    let mut out = format!("# {HEADER_TAG} v{ARRAY_FORMAT_VERSION} shape={}\n", vector.len());
    for value in vector.iter() {
        let _ = writeln!(out, "{value:e}");
    }
    out
}

pub fn format_matrix(matrix: &DMatrix<f64>) -> String {
    let mut out = format!(
        "# {HEADER_TAG} v{ARRAY_FORMAT_VERSION} shape={}x{}\n",
        matrix.nrows(),
        matrix.ncols()
    );
    for row in matrix.row_iter() {
        let line: Vec<String> = row.iter().map(|v| format!("{v:e}")).collect();
        out.push_str(&line.join(" "));
        out.push('\n');
    }
    out
}

pub fn parse_matrix(text: &str, path: &Path) -> Result<DMatrix<f64>, StorageError> {
    let (shape, rows) = parse(text, path)?;
    let parsed = to_matrix(rows);
    match shape {
        Some(Shape::Matrix(0, cols)) if parsed.nrows() == 0 => Ok(DMatrix::zeros(0, cols)),
        Some(Shape::Matrix(r, c)) if (r, c) != parsed.shape() => {
            Err(shape_mismatch(path, format!("{r}x{c}"), &parsed))
        }
        Some(Shape::Vector(n)) if parsed.len() != n || parsed.ncols() > 1 => {
            Err(shape_mismatch(path, n.to_string(), &parsed))
        }
        _ => Ok(parsed),
    }
}

/// Accepts one value per line, a single row, or a vector header.
pub fn parse_vector(text: &str, path: &Path) -> Result<DVector<f64>, StorageError> {
    let (shape, rows) = parse(text, path)?;
    let parsed = to_matrix(rows);
    let values: Vec<f64> = if parsed.ncols() == 1 || parsed.nrows() <= 1 {
        // column-major storage of an n x 1 or 1 x n matrix is already in order
        parsed.iter().copied().collect()
    } else {
        return Err(shape_mismatch(path, "a vector".to_string(), &parsed));
    };
    match shape {
        Some(Shape::Vector(n)) if n != values.len() => {
            Err(shape_mismatch(path, n.to_string(), &parsed))
        }
        Some(Shape::Matrix(r, c)) if r * c != values.len() || (r > 1 && c > 1) => {
            Err(shape_mismatch(path, format!("{r}x{c}"), &parsed))
        }
        _ => Ok(DVector::from_vec(values)),
    }
}

pub fn read_matrix(path: &Path) -> Result<DMatrix<f64>, StorageError> {
    parse_matrix(&read_text(path)?, path)
}

pub fn read_vector(path: &Path) -> Result<DVector<f64>, StorageError> {
    parse_vector(&read_text(path)?, path)
}

pub fn write_matrix(path: &Path, matrix: &DMatrix<f64>) -> Result<(), StorageError> {
    write_atomic(path, format_matrix(matrix).as_bytes())
}

pub fn write_vector(path: &Path, vector: &DVector<f64>) -> Result<(), StorageError> {
    write_atomic(path, format_vector(vector).as_bytes())
}

fn read_text(path: &Path) -> Result<String, StorageError> {
    std::fs::read_to_string(path).map_err(|source| StorageError::Read {
        path: path.to_path_buf(),
        source,
    })
}

fn parse(text: &str, path: &Path) -> Result<(Option<Shape>, Vec<Vec<f64>>), StorageError> {
    let mut shape = None;
    let mut rows = Vec::new();

    for (idx, line) in text.lines().enumerate() {
        let line_num = idx + 1;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if let Some(comment) = trimmed.strip_prefix('#') {
            if shape.is_none() {
                shape = parse_header(comment, path, line_num)?;
            }
            continue;
        }

        let row = trimmed
            .split(|c: char| c.is_whitespace() || c == ',')
            .filter(|token| !token.is_empty())
            .map(|token| {
                token.parse::<f64>().map_err(|e| StorageError::Parse {
                    path: path.to_path_buf(),
                    line: line_num,
                    message: format!("invalid number '{token}': {e}"),
                })
            })
            .collect::<Result<Vec<f64>, _>>()?;

        if let Some(first) = rows.first().map(Vec::len) {
            if first != row.len() {
                return Err(StorageError::Parse {
                    path: path.to_path_buf(),
                    line: line_num,
                    message: format!("expected {first} values, found {}", row.len()),
                });
            }
        }
        rows.push(row);
    }

    Ok((shape, rows))
}

/// `None` for ordinary comments; errors for a header of an unknown version.
fn parse_header(comment: &str, path: &Path, line: usize) -> Result<Option<Shape>, StorageError> {
    let mut tokens = comment.split_whitespace();
    if tokens.next() != Some(HEADER_TAG) {
        return Ok(None);
    }

    let bad_header = |message: String| StorageError::Parse {
        path: path.to_path_buf(),
        line,
        message,
    };

    let version = tokens
        .next()
        .and_then(|v| v.strip_prefix('v'))
        .and_then(|v| v.parse::<u32>().ok())
        .ok_or_else(|| bad_header("missing format version".to_string()))?;
    if version != ARRAY_FORMAT_VERSION {
        return Err(StorageError::UnsupportedSchema {
            path: path.to_path_buf(),
            found: version,
            supported: ARRAY_FORMAT_VERSION,
        });
    }

    let dims = tokens
        .find_map(|t| t.strip_prefix("shape="))
        .ok_or_else(|| bad_header("missing shape".to_string()))?;
    let parse_dim = |s: &str| {
        s.parse::<usize>()
            .map_err(|_| bad_header(format!("invalid shape '{dims}'")))
    };
    let shape = match dims.split_once('x') {
        Some((r, c)) => Shape::Matrix(parse_dim(r)?, parse_dim(c)?),
        None => Shape::Vector(parse_dim(dims)?),
    };
    Ok(Some(shape))
}

fn to_matrix(rows: Vec<Vec<f64>>) -> DMatrix<f64> {
    let nrows = rows.len();
    let ncols = rows.first().map_or(0, Vec::len);
    let flat: Vec<f64> = rows.into_iter().flatten().collect();
    DMatrix::from_row_slice(nrows, ncols, &flat)
}

fn shape_mismatch(path: &Path, expected: String, found: &DMatrix<f64>) -> StorageError {
    StorageError::ShapeMismatch {
        path: path.to_path_buf(),
        expected,
        found: format!("{}x{}", found.nrows(), found.ncols()),
    }
}
