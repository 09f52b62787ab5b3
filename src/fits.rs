//! Reading of FITS files through cfitsio.
//!
//! An upload is spilled to a temporary file which `fitsio` opens. The headers of all
//! header/data units are read up front and their declared sizes checked against the stream.
//! Pixel data is read on request with [`FitsFile::image()`]; cfitsio applies `BSCALE`/`BZERO`
//! and decompresses tile-compressed images.

use std::collections::HashMap;
use std::ffi::{c_char, c_int};
use std::fmt;
use std::io::Write;
use std::sync::Arc;

use fitsio::hdu::HduInfo;
use log::{debug, warn};
use ndarray::Array2;
use parking_lot::Mutex;
use tempfile::NamedTempFile;

use crate::error::FitsError;

/// Size of a FITS block in bytes.
pub const BLOCK_SIZE: usize = 2880;
/// Size of a header card in bytes.
pub const CARD_SIZE: usize = 80;
/// Largest image, in pixels, that [`FitsFile::image()`] will read.
pub const MAX_IMAGE_PIXELS: usize = 1 << 28;

const FLEN_KEYWORD: usize = 75;
const FLEN_VALUE: usize = 71;
const FLEN_COMMENT: usize = 73;

/// cfitsio shares one handle between opens of the same path and is not built reentrant.
static CFITSIO: Mutex<()> = Mutex::new(());

/// Scalar value of a header card.
#[derive(Clone, Debug, PartialEq)]
pub enum HeaderValue {
    /// Logical value, `T` or `F`.
    Boolean(bool),
    /// Integer value.
    Integer(i64),
    /// Floating point value. Fortran `D` exponents are accepted.
    Float(f64),
    /// Quoted string with trailing blanks removed, or an unquoted token that is not a number.
    String(String),
}

impl HeaderValue {
    /// The value as a string slice, if it is a string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            HeaderValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// The value as an integer. Floats are accepted when they are integral.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            HeaderValue::Integer(i) => Some(*i),
            HeaderValue::Float(f) if f.fract() == 0. && f.abs() < i64::MAX as f64 => Some(*f as i64),
            _ => None,
        }
    }

    /// The value as a float. Numeric strings are parsed, since some writers quote numbers.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            HeaderValue::Float(f) => Some(*f),
            HeaderValue::Integer(i) => Some(*i as f64),
            HeaderValue::String(s) => s.trim().replace(['D', 'd'], "E").parse().ok(),
            HeaderValue::Boolean(_) => None,
        }
    }

    /// The value as a logical.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            HeaderValue::Boolean(b) => Some(*b),
            _ => None,
        }
    }
}

impl fmt::Display for HeaderValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeaderValue::Boolean(true) => write!(f, "T"),
            HeaderValue::Boolean(false) => write!(f, "F"),
            HeaderValue::Integer(i) => write!(f, "{i}"),
            HeaderValue::Float(x) => write!(f, "{x:E}"),
            HeaderValue::String(s) => write!(f, "'{}'", s.replace('\'', "''")),
        }
    }
}

impl From<bool> for HeaderValue {
    fn from(value: bool) -> Self {
        HeaderValue::Boolean(value)
    }
}

impl From<i64> for HeaderValue {
    fn from(value: i64) -> Self {
        HeaderValue::Integer(value)
    }
}

impl From<i32> for HeaderValue {
    fn from(value: i32) -> Self {
        HeaderValue::Integer(value.into())
    }
}

impl From<usize> for HeaderValue {
    fn from(value: usize) -> Self {
        HeaderValue::Integer(value as i64)
    }
}

impl From<f64> for HeaderValue {
    fn from(value: f64) -> Self {
        HeaderValue::Float(value)
    }
}

impl From<&str> for HeaderValue {
    fn from(value: &str) -> Self {
        HeaderValue::String(value.to_string())
    }
}

impl From<String> for HeaderValue {
    fn from(value: String) -> Self {
        HeaderValue::String(value)
    }
}

/// Ordered keyword/value map of one header.
///
/// Keys are stored upper case. Commentary cards (`COMMENT`, `HISTORY`, blank keys) are dropped.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Header {
    cards: Vec<(String, HeaderValue)>,
    index: HashMap<String, usize>,
}

impl Header {
    /// Create an empty header.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a keyword. An existing keyword keeps its position and gets the new value.
    pub fn insert(&mut self, key: impl AsRef<str>, value: impl Into<HeaderValue>) {
        let key = key.as_ref().trim().to_uppercase();
        let value = value.into();
        match self.index.get(&key) {
            Some(&i) => self.cards[i].1 = value,
            None => {
                self.index.insert(key.clone(), self.cards.len());
                self.cards.push((key, value));
            }
        }
    }

    /// Builder variant of [`insert`](Header::insert()).
    pub fn with(mut self, key: impl AsRef<str>, value: impl Into<HeaderValue>) -> Self {
        self.insert(key, value);
        self
    }

    /// Look up a keyword, case-insensitively.
    pub fn get(&self, key: &str) -> Option<&HeaderValue> {
        let i = match self.index.get(key) {
            Some(i) => *i,
            None => *self.index.get(&key.to_uppercase())?,
        };
        Some(&self.cards[i].1)
    }

    /// Whether the keyword is present.
    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// String value of a keyword.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(HeaderValue::as_str)
    }

    /// Integer value of a keyword.
    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(HeaderValue::as_i64)
    }

    /// Float value of a keyword.
    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.get(key).and_then(HeaderValue::as_f64)
    }

    /// Logical value of a keyword.
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(HeaderValue::as_bool)
    }

    /// Iterate over the cards in header order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &HeaderValue)> {
        self.cards.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Number of keywords.
    pub fn len(&self) -> usize {
        self.cards.len()
    }

    /// Whether the header has no keywords.
    pub fn is_empty(&self) -> bool {
        self.cards.is_empty()
    }

    /// Combine with `base`, keywords of `self` taking precedence.
    ///
    /// Used to let an extension header inherit keywords from the primary header.
    pub fn with_fallback(&self, base: &Header) -> Header {
        let mut merged = self.clone();
        for (key, value) in base.iter() {
            if !merged.contains(key) {
                merged.insert(key, value.clone());
            }
        }
        merged
    }
}

/// Kind of a header/data unit, as reported by cfitsio.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HduKind {
    /// The primary HDU.
    Primary,
    /// An `IMAGE` extension.
    Image,
    /// A `BINTABLE` extension holding a tile-compressed image (`ZIMAGE = T`).
    CompressedImage,
    /// An ASCII or binary table.
    Table,
    /// Any other extension type.
    Other,
}

/// One header/data unit of a FITS file.
#[derive(Clone, Debug)]
pub struct Hdu {
    /// Zero-based position in the file.
    pub index: usize,
    /// Parsed header.
    pub header: Header,
    /// Kind of the unit.
    pub kind: HduKind,
    shape: Option<(usize, usize)>,
    data_len: usize,
}

impl Hdu {
    /// Image shape as `(rows, columns)`, i.e. `(NAXIS2, NAXIS1)`.
    ///
    /// Tile-compressed images report their uncompressed shape.
    /// Returns `None` if the unit is not a two-dimensional image.
    /// Additional axes of length one are accepted.
    pub fn shape(&self) -> Option<(usize, usize)> {
        self.shape
    }

    /// Whether the unit holds a non-empty two-dimensional image.
    pub fn is_image(&self) -> bool {
        matches!(self.shape, Some((rows, cols)) if rows > 0 && cols > 0)
    }

    /// Value of `EXTNAME`, if present.
    pub fn extension_name(&self) -> Option<&str> {
        self.header.get_str("EXTNAME").map(str::trim)
    }

    /// Size of the data unit in bytes as declared by the header, without padding.
    pub fn data_len(&self) -> usize {
        self.data_len
    }
}

/// A FITS file opened through cfitsio.
///
/// Owns the temporary copy of the stream, which is removed when the last clone is dropped.
#[derive(Clone, Debug)]
pub struct FitsFile {
    file: Arc<NamedTempFile>,
    hdus: Vec<Hdu>,
}

impl FitsFile {
    /// Read the headers of every unit of a FITS byte stream.
    ///
    /// Fails if the stream does not start with a primary header, if cfitsio rejects a unit or if
    /// the data declared by any header does not fit in the stream. Trailing blank padding after
    /// the last unit is ignored.
    pub fn parse(bytes: impl AsRef<[u8]>) -> Result<Self, FitsError> {
        let bytes = bytes.as_ref();
        if !bytes.starts_with(b"SIMPLE  =") {
            return Err(FitsError::NotFits(
                "stream does not start with a SIMPLE card".to_string(),
            ));
        }

        let mut file = tempfile::Builder::new()
            .prefix("upload")
            .suffix(".fits")
            .tempfile()?;
        file.write_all(bytes)?;
        file.flush()?;

        let _cfitsio = CFITSIO.lock();
        let mut fptr = fitsio::FitsFile::open(file.path())?;
        let mut hdus = Vec::new();
        let mut offset = 0;
        while offset < bytes.len() {
            let index = hdus.len();
            let remaining = &bytes[offset..];
            if remaining.iter().all(|b| *b == 0 || *b == b' ') {
                break;
            }
            if remaining.len() < BLOCK_SIZE && index > 0 {
                warn!(
                    "Ignoring {} trailing bytes after HDU {}.",
                    remaining.len(),
                    index - 1
                );
                break;
            }

            let unit = fptr.hdu(index)?;
            let header = read_header(&mut fptr, index)?;
            let (header_start, data_start) = unit_offsets(&mut fptr, index)?;
            let data_len = data_size(&header, index)?;
            let data_end = data_start
                .checked_add(data_len)
                .ok_or(FitsError::Oversized { hdu: index })?;
            if data_end > bytes.len() {
                return Err(FitsError::Truncated {
                    hdu: index,
                    needed: data_end - header_start,
                    available: bytes.len().saturating_sub(header_start),
                });
            }

            let (kind, shape) = match &unit.info {
                HduInfo::ImageInfo { shape, .. } => {
                    let kind = if index == 0 {
                        HduKind::Primary
                    } else if header.get_bool("ZIMAGE") == Some(true) {
                        HduKind::CompressedImage
                    } else {
                        HduKind::Image
                    };
                    (kind, plane_shape(shape))
                }
                HduInfo::TableInfo { .. } => (HduKind::Table, None),
                HduInfo::AnyInfo => (HduKind::Other, None),
            };
            debug!("HDU {index}: {kind:?}, {data_len} data bytes.");
            hdus.push(Hdu {
                index,
                header,
                kind,
                shape,
                data_len,
            });
            offset = data_start + padded(data_len);
        }

        Ok(Self {
            file: Arc::new(file),
            hdus,
        })
    }

    /// All header/data units in file order.
    pub fn hdus(&self) -> &[Hdu] {
        &self.hdus
    }

    /// The primary header/data unit.
    pub fn primary(&self) -> &Hdu {
        &self.hdus[0]
    }

    /// Header/data unit at `index`.
    pub fn hdu(&self, index: usize) -> Option<&Hdu> {
        self.hdus.get(index)
    }

    /// Number of header/data units. Always at least one.
    pub fn len(&self) -> usize {
        self.hdus.len()
    }

    /// Always `false`, a parsed file has a primary unit.
    pub fn is_empty(&self) -> bool {
        self.hdus.is_empty()
    }

    /// Read the pixel data of `hdu` into an array of shape `(rows, columns)`.
    ///
    /// Integer data is scaled by `BSCALE`/`BZERO`, `BLANK` pixels become `NaN`.
    /// Images above [`MAX_IMAGE_PIXELS`] are rejected before any allocation.
    pub fn image(&self, hdu: &Hdu) -> Result<Array2<f32>, FitsError> {
        let (rows, cols) = hdu.shape().ok_or(FitsError::NotAnImage(hdu.index))?;
        match rows.checked_mul(cols) {
            Some(pixels) if pixels <= MAX_IMAGE_PIXELS => {}
            _ => return Err(FitsError::Oversized { hdu: hdu.index }),
        }

        let mut pixels: Vec<f32> = {
            let _cfitsio = CFITSIO.lock();
            let mut fptr = fitsio::FitsFile::open(self.file.path())?;
            let unit = fptr.hdu(hdu.index)?;
            unit.read_image(&mut fptr)?
        };
        mask_blank(&hdu.header, &mut pixels);
        Array2::from_shape_vec((rows, cols), pixels).map_err(|_| FitsError::NotAnImage(hdu.index))
    }
}

fn padded(len: usize) -> usize {
    len.div_ceil(BLOCK_SIZE) * BLOCK_SIZE
}

/// `(rows, columns)` of a row-major cfitsio shape whose leading axes all have length one.
fn plane_shape(shape: &[usize]) -> Option<(usize, usize)> {
    let split = shape.len().checked_sub(2)?;
    let (extra, plane) = shape.split_at(split);
    if extra.iter().any(|len| *len != 1) {
        return None;
    }
    Some((plane[0], plane[1]))
}

fn c_string(buffer: &[c_char]) -> String {
    let bytes: Vec<u8> = buffer
        .iter()
        .take_while(|c| **c != 0)
        .map(|c| *c as u8)
        .collect();
    String::from_utf8_lossy(&bytes).into_owned()
}

/// Byte offsets of the header and the data of the current unit.
fn unit_offsets(fptr: &mut fitsio::FitsFile, hdu: usize) -> Result<(usize, usize), FitsError> {
    let mut status: c_int = 0;
    let (mut header, mut data, mut end): (i64, i64, i64) = (0, 0, 0);
    // SAFETY: the pointer is only used while `fptr` is mutably borrowed.
    let raw = unsafe { fptr.as_raw() };
    // SAFETY: `raw` is an open file positioned on the unit, the out parameters are valid.
    unsafe { fitsio::sys::ffghadll(raw, &mut header, &mut data, &mut end, &mut status) };
    if status != 0 {
        return Err(FitsError::Cfitsio(format!("status {status} locating HDU {hdu}")));
    }
    let offset = |value: i64| usize::try_from(value).map_err(|_| FitsError::Oversized { hdu });
    Ok((offset(header)?, offset(data)?))
}

/// One card as split by cfitsio.
struct Card {
    key: String,
    value: String,
    comment: String,
}

/// All cards of the current unit of `fptr`, without `END`.
fn read_cards(fptr: &mut fitsio::FitsFile, hdu: usize) -> Result<Vec<Card>, FitsError> {
    let mut status: c_int = 0;
    let mut count: c_int = 0;
    let mut more: c_int = 0;
    // SAFETY: the pointer is only used while `fptr` is mutably borrowed.
    let raw = unsafe { fptr.as_raw() };
    // SAFETY: `raw` is an open file positioned on the unit, the out parameters are valid.
    unsafe { fitsio::sys::ffghsp(raw, &mut count, &mut more, &mut status) };
    if status != 0 {
        return Err(FitsError::Card { hdu, card: 0, status });
    }

    let mut cards = Vec::with_capacity(count.max(0) as usize);
    for n in 1..=count {
        let mut key = [0 as c_char; FLEN_KEYWORD];
        let mut value = [0 as c_char; FLEN_VALUE];
        let mut comment = [0 as c_char; FLEN_COMMENT];
        // SAFETY: the buffers have the lengths cfitsio writes at most.
        unsafe {
            fitsio::sys::ffgkyn(
                raw,
                n,
                key.as_mut_ptr(),
                value.as_mut_ptr(),
                comment.as_mut_ptr(),
                &mut status,
            )
        };
        if status != 0 {
            return Err(FitsError::Card { hdu, card: n, status });
        }
        cards.push(Card {
            key: c_string(&key).trim().to_uppercase(),
            value: c_string(&value),
            comment: c_string(&comment),
        });
    }
    Ok(cards)
}

/// Header of the current unit. Long strings continued over `CONTINUE` cards are joined.
fn read_header(fptr: &mut fitsio::FitsFile, hdu: usize) -> Result<Header, FitsError> {
    let mut header = Header::new();
    let mut continued: Option<String> = None;

    for Card { key, value, comment } in read_cards(fptr, hdu)? {
        if key == "CONTINUE" {
            let field = if value.is_empty() { comment } else { value };
            if let (Some(long_key), Some(HeaderValue::String(part))) =
                (continued.take(), parse_value(&field))
            {
                let (part, more) = split_continuation(part);
                if let Some(HeaderValue::String(head)) = header.get(&long_key).cloned() {
                    header.insert(&long_key, head + &part);
                }
                if more {
                    continued = Some(long_key);
                }
            }
            continue;
        }
        continued = None;

        if matches!(key.as_str(), "" | "COMMENT" | "HISTORY" | "END") {
            continue;
        }
        match parse_value(&value) {
            Some(HeaderValue::String(value)) => {
                let (value, more) = split_continuation(value);
                if more {
                    continued = Some(key.clone());
                }
                header.insert(key, value);
            }
            Some(value) => header.insert(key, value),
            None => {}
        }
    }
    Ok(header)
}

fn split_continuation(value: String) -> (String, bool) {
    match value.strip_suffix('&') {
        Some(stripped) => (stripped.to_string(), true),
        None => (value, false),
    }
}

/// Interpret the value field of a card, as returned by cfitsio.
fn parse_value(field: &str) -> Option<HeaderValue> {
    let field = field.trim_start();
    if let Some(rest) = field.strip_prefix('\'') {
        let mut value = String::new();
        let mut chars = rest.chars().peekable();
        while let Some(c) = chars.next() {
            if c == '\'' {
                if chars.peek() == Some(&'\'') {
                    chars.next();
                    value.push('\'');
                } else {
                    break;
                }
            } else {
                value.push(c);
            }
        }
        return Some(HeaderValue::String(value.trim_end().to_string()));
    }

    let token = field.split_once('/').map_or(field, |(v, _)| v).trim();
    match token {
        "" => None,
        "T" => Some(HeaderValue::Boolean(true)),
        "F" => Some(HeaderValue::Boolean(false)),
        _ => token
            .parse::<i64>()
            .map(HeaderValue::Integer)
            .or_else(|_| token.replace(['D', 'd'], "E").parse().map(HeaderValue::Float))
            .ok()
            .or_else(|| Some(HeaderValue::String(token.to_string()))),
    }
}

fn required_usize(header: &Header, key: &str, hdu: usize) -> Result<usize, FitsError> {
    header
        .get_i64(key)
        .and_then(|v| usize::try_from(v).ok())
        .ok_or(FitsError::Keyword {
            hdu,
            keyword: key.to_string(),
        })
}

/// Size of the data unit in bytes, without padding.
fn data_size(header: &Header, hdu: usize) -> Result<usize, FitsError> {
    let bitpix = header.get_i64("BITPIX").ok_or(FitsError::Keyword {
        hdu,
        keyword: "BITPIX".to_string(),
    })?;
    if !matches!(bitpix, 8 | 16 | 32 | 64 | -32 | -64) {
        return Err(FitsError::UnsupportedBitpix(bitpix));
    }
    let naxis = required_usize(header, "NAXIS", hdu)?;
    if naxis == 0 {
        return Ok(0);
    }

    let random_groups = header.get_bool("GROUPS") == Some(true) && header.get_i64("NAXIS1") == Some(0);
    let first_axis = if random_groups { 2 } else { 1 };
    let mut elements: usize = 1;
    for n in first_axis..=naxis {
        let len = required_usize(header, &format!("NAXIS{n}"), hdu)?;
        elements = elements.checked_mul(len).ok_or(FitsError::Oversized { hdu })?;
    }

    let pcount = header.get_i64("PCOUNT").unwrap_or(0).max(0);
    let gcount = header.get_i64("GCOUNT").unwrap_or(1).max(0);
    let bytes = bitpix.unsigned_abs() as usize / 8;
    usize::try_from(pcount)
        .ok()
        .and_then(|pcount| pcount.checked_add(elements))
        .zip(usize::try_from(gcount).ok())
        .and_then(|(group, gcount)| group.checked_mul(gcount))
        .and_then(|len| len.checked_mul(bytes))
        .ok_or(FitsError::Oversized { hdu })
}

/// Replace integer samples equal to `BLANK` by `NaN`.
fn mask_blank(header: &Header, pixels: &mut [f32]) {
    let Some(blank) = header.get_i64("BLANK") else {
        return;
    };
    if header.get_i64("BITPIX").is_none_or(|bitpix| bitpix < 0) {
        return;
    }
    let scale = header.get_f64("BSCALE").unwrap_or(1.);
    let zero = header.get_f64("BZERO").unwrap_or(0.);
    let blank = (blank as f64 * scale + zero) as f32;
    pixels
        .iter_mut()
        .filter(|p| **p == blank)
        .for_each(|p| *p = f32::NAN);
}
