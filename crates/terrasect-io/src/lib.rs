//! terrasect-io — PCD / PLY / LAS readers and writers, frame streaming.

use anyhow::{bail, ensure, Context, Result};
use log::debug;
use ply_rs::parser::Parser;
use ply_rs::ply::{DefaultElement, Ply, Property};
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use terrasect_core::Cloud;

/// Extensions `read_auto` understands (lower-case).
pub const SUPPORTED_EXTENSIONS: [&str; 3] = ["pcd", "ply", "las"];

fn extension(path: &Path) -> String {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default()
}

// ---------- PCD ----------

/// Largest per-field element count accepted (histogram descriptors stay well below).
const MAX_PCD_COUNT: usize = 65_536;

#[derive(Debug, Clone, Copy, PartialEq)]
enum PcdData { Ascii, Binary }

#[derive(Debug)]
struct PcdHeader {
    fields: Vec<String>,
    sizes: Vec<usize>,
    types: Vec<char>,
    counts: Vec<usize>,
    points: usize,
    data: PcdData,
}

impl PcdHeader {
    fn position(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f == name)
    }

    /// Byte offset of each field inside one binary record.
    fn offsets(&self) -> Vec<usize> {
        let mut off = Vec::with_capacity(self.fields.len());
        let mut acc = 0;
        for i in 0..self.fields.len() {
            off.push(acc);
            acc += self.sizes[i] * self.counts[i];
        }
        off
    }

    fn record_size(&self) -> usize {
        (0..self.fields.len()).map(|i| self.sizes[i] * self.counts[i]).sum()
    }

    /// Token / column index of each field's first element in an ASCII row.
    fn columns(&self) -> Vec<usize> {
        let mut col = Vec::with_capacity(self.counts.len());
        let mut acc = 0;
        for &c in &self.counts {
            col.push(acc);
            acc += c;
        }
        col
    }
}

fn parse_pcd_header<R: BufRead>(r: &mut R) -> Result<PcdHeader> {
    let mut fields = Vec::new();
    let mut sizes = Vec::new();
    let mut types = Vec::new();
    let mut counts = Vec::new();
    let (mut width, mut height, mut points) = (0usize, 1usize, None::<usize>);

    let mut line = String::new();
    loop {
        line.clear();
        if r.read_line(&mut line)? == 0 {
            bail!("PCD header ended without a DATA line");
        }
        let l = line.trim();
        if l.is_empty() || l.starts_with('#') { continue; }
        let mut tok = l.split_whitespace();
        let Some(kw) = tok.next() else { continue };
        let rest: Vec<&str> = tok.collect();
        match kw.to_ascii_uppercase().as_str() {
            "VERSION" | "VIEWPOINT" => {}
            "FIELDS" | "COLUMNS" => fields = rest.iter().map(|s| s.to_string()).collect(),
            "SIZE" => sizes = rest.iter().map(|s| s.parse()).collect::<Result<_, _>>()?,
            "TYPE" => {
                types = rest
                    .iter()
                    .map(|s| s.chars().next().map(|c| c.to_ascii_uppercase()))
                    .collect::<Option<_>>()
                    .context("empty PCD TYPE entry")?
            }
            "COUNT" => counts = rest.iter().map(|s| s.parse()).collect::<Result<_, _>>()?,
            "WIDTH" => width = rest.first().context("WIDTH without value")?.parse()?,
            "HEIGHT" => height = rest.first().context("HEIGHT without value")?.parse()?,
            "POINTS" => points = Some(rest.first().context("POINTS without value")?.parse()?),
            "DATA" => {
                let data = match rest.first().map(|s| s.to_ascii_lowercase()).as_deref() {
                    Some("ascii") => PcdData::Ascii,
                    Some("binary") => PcdData::Binary,
                    Some(other) => bail!("unsupported PCD DATA encoding '{other}'"),
                    None => bail!("DATA without encoding"),
                };
                if counts.is_empty() { counts = vec![1; fields.len()]; }
                ensure!(!fields.is_empty(), "PCD header has no FIELDS");
                ensure!(
                    sizes.len() == fields.len() && types.len() == fields.len() && counts.len() == fields.len(),
                    "PCD FIELDS/SIZE/TYPE/COUNT lengths disagree"
                );
                ensure!(sizes.iter().all(|s| matches!(s, 1 | 2 | 4 | 8)), "PCD SIZE entries must be 1, 2, 4 or 8");
                ensure!(
                    counts.iter().all(|c| (1..=MAX_PCD_COUNT).contains(c)),
                    "PCD COUNT entries must be in 1..={MAX_PCD_COUNT}"
                );
                let points = match points {
                    Some(p) => p,
                    None => width.checked_mul(height).context("PCD WIDTH * HEIGHT overflows")?,
                };
                return Ok(PcdHeader { fields, sizes, types, counts, points, data });
            }
            other => bail!("unknown PCD header keyword '{other}'"),
        }
    }
}

fn decode_binary(ty: char, size: usize, b: &[u8]) -> Result<f32> {
    Ok(match (ty, size) {
        ('F', 4) => f32::from_le_bytes(b.try_into()?),
        ('F', 8) => f64::from_le_bytes(b.try_into()?) as f32,
        ('U', 1) => b[0] as f32,
        ('I', 1) => b[0] as i8 as f32,
        ('U', 2) => u16::from_le_bytes(b.try_into()?) as f32,
        ('I', 2) => i16::from_le_bytes(b.try_into()?) as f32,
        ('U', 4) => u32::from_le_bytes(b.try_into()?) as f32,
        ('I', 4) => i32::from_le_bytes(b.try_into()?) as f32,
        _ => bail!("unsupported PCD field type {ty}{size}"),
    })
}

/// Read a PCD file (`DATA ascii` or `DATA binary`).
///
/// x/y/z are required; every other scalar field (COUNT 1) except packed
/// colour (`rgb`/`rgba`) becomes an attribute column.
pub fn read_pcd<P: AsRef<Path>>(path: P) -> Result<Cloud> {
    let path = path.as_ref();
    let f = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let mut reader = BufReader::new(f);
    let hdr = parse_pcd_header(&mut reader).with_context(|| format!("PCD header of {}", path.display()))?;

    let (ix, iy, iz) = match (hdr.position("x"), hdr.position("y"), hdr.position("z")) {
        (Some(x), Some(y), Some(z)) => (x, y, z),
        _ => bail!("{}: PCD needs x, y and z fields", path.display()),
    };
    let extra: Vec<usize> = (0..hdr.fields.len())
        .filter(|&i| ![ix, iy, iz].contains(&i))
        .filter(|&i| hdr.counts[i] == 1 && !matches!(hdr.fields[i].as_str(), "rgb" | "rgba" | "_"))
        .collect();

    // POINTS is untrusted: reserve no more rows than the file could hold
    let file_len = usize::try_from(reader.get_ref().metadata()?.len()).unwrap_or(usize::MAX);
    let row_values: usize = hdr.counts.iter().sum();
    let fits = match hdr.data {
        PcdData::Ascii => file_len / (2 * row_values),
        PcdData::Binary => {
            let rec = hdr.record_size();
            let fits = file_len / rec;
            ensure!(
                hdr.points <= fits,
                "{}: PCD declares {} binary points of {} bytes, file is only {} bytes",
                path.display(), hdr.points, rec, file_len
            );
            fits
        }
    };
    let cap = hdr.points.min(fits);
    let mut c = Cloud::default();
    c.reserve(cap);
    let mut cols: Vec<Vec<f32>> = vec![Vec::with_capacity(cap); extra.len()];

    match hdr.data {
        PcdData::Ascii => {
            let at = hdr.columns();
            let width = row_values;
            let mut line = String::new();
            while c.len() < hdr.points {
                line.clear();
                if reader.read_line(&mut line)? == 0 { break; }
                let tok: Vec<&str> = line.split_whitespace().collect();
                if tok.is_empty() { continue; }
                ensure!(tok.len() >= width, "PCD row {} has {} values, expected {}", c.len(), tok.len(), width);
                let v = |f: usize| -> Result<f32> {
                    tok[at[f]].parse::<f32>().with_context(|| format!("bad value '{}'", tok[at[f]]))
                };
                c.push(v(ix)?, v(iy)?, v(iz)?);
                for (col, &f) in cols.iter_mut().zip(&extra) { col.push(v(f)?); }
            }
        }
        PcdData::Binary => {
            let off = hdr.offsets();
            let rec = hdr.record_size();
            let mut buf = vec![0u8; rec];
            for _ in 0..hdr.points {
                reader.read_exact(&mut buf).context("PCD binary payload truncated")?;
                let v = |f: usize| decode_binary(hdr.types[f], hdr.sizes[f], &buf[off[f]..off[f] + hdr.sizes[f]]);
                c.push(v(ix)?, v(iy)?, v(iz)?);
                for (col, &f) in cols.iter_mut().zip(&extra) { col.push(v(f)?); }
            }
        }
    }
    ensure!(c.len() == hdr.points, "PCD declares {} points, found {}", hdr.points, c.len());

    for (col, &f) in cols.into_iter().zip(&extra) {
        c.attrs_f32.insert(hdr.fields[f].clone(), col);
    }
    debug!("read {} points from {}", c.len(), path.display());
    Ok(c)
}

/// Write an ASCII PCD with x y z followed by aligned attribute columns.
pub fn write_pcd_ascii<P: AsRef<Path>>(path: P, cloud: &Cloud) -> Result<()> {
    let path = path.as_ref();
    let n = cloud.len();
    let keys = cloud.aligned_attr_keys();
    let mut w = BufWriter::new(File::create(path).with_context(|| format!("create {}", path.display()))?);

    let names: Vec<&str> = ["x", "y", "z"].into_iter().chain(keys.iter().map(String::as_str)).collect();
    writeln!(w, "# .PCD v0.7 - Point Cloud Data file format")?;
    writeln!(w, "VERSION 0.7")?;
    writeln!(w, "FIELDS {}", names.join(" "))?;
    writeln!(w, "SIZE {}", vec!["4"; names.len()].join(" "))?;
    writeln!(w, "TYPE {}", vec!["F"; names.len()].join(" "))?;
    writeln!(w, "COUNT {}", vec!["1"; names.len()].join(" "))?;
    writeln!(w, "WIDTH {}", n)?;
    writeln!(w, "HEIGHT 1")?;
    writeln!(w, "VIEWPOINT 0 0 0 1 0 0 0")?;
    writeln!(w, "POINTS {}", n)?;
    writeln!(w, "DATA ascii")?;
    for i in 0..n {
        write!(w, "{} {} {}", cloud.x[i], cloud.y[i], cloud.z[i])?;
        for k in &keys {
            write!(w, " {}", cloud.attrs_f32[k][i])?;
        }
        writeln!(w)?;
    }
    w.flush()?;
    debug!("saved {} points to {}", n, path.display());
    Ok(())
}

// ---------- PLY ----------

/// Read a PLY file (any encoding ply-rs parses) with float-like x,y,z.
pub fn read_ply<P: AsRef<Path>>(path: P) -> Result<Cloud> {
    let path = path.as_ref();
    let f = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let mut reader = BufReader::new(f);
    let parser = Parser::<DefaultElement>::new();
    let ply: Ply<DefaultElement> = parser.read_ply(&mut reader)?;

    // Expect "vertex" element with float x,y,z.
    let vertex = ply.payload.get("vertex")
        .ok_or_else(|| anyhow::anyhow!("PLY missing 'vertex' element"))?;

    let mut c = Cloud::default();
    c.reserve(vertex.len());
    let present: Vec<&str> = match vertex.first() {
        Some(el) => ["intensity", "red", "green", "blue"].into_iter().filter(|k| el.contains_key(*k)).collect(),
        None => Vec::new(),
    };
    let mut cols: Vec<Vec<f32>> = vec![Vec::with_capacity(vertex.len()); present.len()];

    for el in vertex {
        c.push(get_f32(el, "x")?, get_f32(el, "y")?, get_f32(el, "z")?);
        for (col, k) in cols.iter_mut().zip(&present) {
            col.push(get_f32(el, k)?);
        }
    }
    for (col, k) in cols.into_iter().zip(present) {
        c.attrs_f32.insert(k.to_string(), col);
    }
    Ok(c)
}

fn get_f32(el: &DefaultElement, key: &str) -> Result<f32> {
    match el.get(key) {
        Some(Property::Float(v)) => Ok(*v),
        Some(Property::Double(v)) => Ok(*v as f32),
        Some(Property::UChar(v)) => Ok(*v as f32),
        Some(Property::Char(v)) => Ok(*v as f32),
        Some(Property::UShort(v)) => Ok(*v as f32),
        Some(Property::Short(v)) => Ok(*v as f32),
        Some(Property::UInt(v)) => Ok(*v as f32),
        Some(Property::Int(v)) => Ok(*v as f32),
        Some(_) => bail!("property '{}' not float-like", key),
        None => bail!("missing property '{}'", key),
    }
}

pub fn write_ply_ascii<P: AsRef<Path>>(path: P, cloud: &Cloud) -> Result<()> {
    let path = path.as_ref();
    let n = cloud.len();
    let mut w = BufWriter::new(File::create(path).with_context(|| format!("create {}", path.display()))?);
    let keys = cloud.aligned_attr_keys();

    // Header
    writeln!(w, "ply")?;
    writeln!(w, "format ascii 1.0")?;
    writeln!(w, "element vertex {}", n)?;
    writeln!(w, "property float x")?;
    writeln!(w, "property float y")?;
    writeln!(w, "property float z")?;
    for k in &keys {
        writeln!(w, "property float {}", k)?;
    }
    writeln!(w, "end_header")?;

    // Body
    for i in 0..n {
        write!(w, "{} {} {}", cloud.x[i], cloud.y[i], cloud.z[i])?;
        for k in &keys {
            write!(w, " {}", cloud.attrs_f32[k][i])?;
        }
        writeln!(w)?;
    }
    w.flush()?;
    Ok(())
}

// ---------- LAS ----------

pub fn read_las<P: AsRef<Path>>(path: P) -> Result<Cloud> {
    let path = path.as_ref();
    let mut r = las::Reader::from_path(path).with_context(|| format!("open {}", path.display()))?;
    let total = r.header().number_of_points() as usize;

    let mut c = Cloud::default();
    c.reserve(total);
    let mut intensity = Vec::with_capacity(total);
    let mut class = Vec::with_capacity(total);

    for rec in r.points() {
        let p = rec?; // las::Point
        // x/y/z are f64 with scale/offset already applied by Reader
        c.push(p.x as f32, p.y as f32, p.z as f32);
        // intensity is ALWAYS present as u16 in LAS point formats
        intensity.push(p.intensity as f32);
        class.push(u8::from(p.classification) as f32);
    }
    c.attrs_f32.insert("intensity".into(), intensity);
    c.attrs_f32.insert("class".into(), class);
    Ok(c)
}

// ---------- dispatch ----------

pub fn read_auto<P: AsRef<Path>>(path: P) -> Result<Cloud> {
    let path = path.as_ref();
    match extension(path).as_str() {
        "pcd" => read_pcd(path),
        "ply" => read_ply(path),
        "las" => read_las(path),
        other => bail!("unsupported point cloud file '{}' (extension '{other}'; expected pcd, ply or las)", path.display()),
    }
}

pub fn write_auto<P: AsRef<Path>>(path: P, cloud: &Cloud) -> Result<()> {
    let path = path.as_ref();
    match extension(path).as_str() {
        "pcd" => write_pcd_ascii(path, cloud),
        "ply" => write_ply_ascii(path, cloud),
        other => bail!("cannot write '{}' (extension '{other}'; expected pcd or ply)", path.display()),
    }
}

/// Readable frames in `dir`, sorted by file name so recordings play in order.
pub fn stream_dir<P: AsRef<Path>>(dir: P) -> Result<Vec<PathBuf>> {
    let dir = dir.as_ref();
    let mut frames = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("list {}", dir.display()))? {
        let p = entry?.path();
        if p.is_file() && SUPPORTED_EXTENSIONS.contains(&extension(&p).as_str()) {
            frames.push(p);
        }
    }
    frames.sort();
    debug!("{} frames in {}", frames.len(), dir.display());
    Ok(frames)
}
