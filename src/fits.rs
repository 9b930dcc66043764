//! Minimal reader for HEALPix probability-grid FITS files.
//!
//! Localizations are distributed as FITS binary tables in one of two shapes:
//! multi-order maps with `UNIQ`/`PROBDENSITY` columns, or fixed-resolution
//! nested maps with a per-pixel `PROB` column and an `NSIDE` header. Both are
//! decoded into [`ProbabilityCell`]s; ring-ordered fixed grids are rejected.
//!
//! Only the subset of the format needed for these tables is understood:
//! 2880-byte blocks of 80-character header cards, followed by big-endian
//! row-major table data.

use crate::error::CrossmatchError;
use crate::region::ProbabilityCell;

const BLOCK_SIZE: usize = 2880;
const CARD_SIZE: usize = 80;

fn malformed(msg: impl Into<String>) -> CrossmatchError {
    CrossmatchError::MalformedResponse(msg.into())
}

/// Decode a probability-grid file into its cells.
pub fn read_probability_cells(bytes: &[u8]) -> Result<Vec<ProbabilityCell>, CrossmatchError> {
    let mut offset = 0;
    let primary = read_header(bytes, &mut offset)?;
    if primary.get("SIMPLE") != Some("T") {
        return Err(malformed("not a FITS file"));
    }
    skip_data(&primary, &mut offset)?;

    while offset < bytes.len() {
        let header = read_header(bytes, &mut offset)?;
        if header.get("XTENSION") == Some("BINTABLE") {
            return read_table(bytes, offset, &header);
        }
        skip_data(&header, &mut offset)?;
    }
    Err(malformed("no binary table extension found"))
}

struct Header {
    cards: Vec<(String, String)>,
}

impl Header {
    fn get(&self, key: &str) -> Option<&str> {
        self.cards
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    fn get_usize(&self, key: &str) -> Result<usize, CrossmatchError> {
        self.get(key)
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| malformed(format!("missing or invalid {key} header")))
    }
}

/// Read one header unit starting at `*offset`, leaving `*offset` at the first
/// data byte (header blocks are padded to a 2880-byte boundary).
fn read_header(bytes: &[u8], offset: &mut usize) -> Result<Header, CrossmatchError> {
    let mut cards = Vec::new();
    let mut pos = *offset;
    loop {
        let card = bytes
            .get(pos..pos + CARD_SIZE)
            .ok_or_else(|| malformed("truncated FITS header"))?;
        pos += CARD_SIZE;

        let key = std::str::from_utf8(&card[..8])
            .map_err(|_| malformed("non-ASCII FITS header key"))?
            .trim()
            .to_string();
        if key == "END" {
            break;
        }
        if card[8..10] == *b"= " {
            let raw = std::str::from_utf8(&card[10..])
                .map_err(|_| malformed("non-ASCII FITS header value"))?;
            cards.push((key, parse_card_value(raw)));
        }
    }
    *offset = next_block_boundary(pos);
    Ok(Header { cards })
}

/// Strip quoting and inline comments from a header card value.
fn parse_card_value(raw: &str) -> String {
    let raw = raw.trim_start();
    if let Some(rest) = raw.strip_prefix('\'') {
        match rest.find('\'') {
            Some(end) => rest[..end].trim().to_string(),
            None => rest.trim().to_string(),
        }
    } else {
        raw.split('/').next().unwrap_or("").trim().to_string()
    }
}

/// Advance `*offset` past the data unit described by `header`.
fn skip_data(header: &Header, offset: &mut usize) -> Result<(), CrossmatchError> {
    let bitpix = header
        .get("BITPIX")
        .and_then(|v| v.parse::<i64>().ok())
        .unwrap_or(8)
        .unsigned_abs() as usize;
    let naxis = header.get("NAXIS").and_then(|v| v.parse::<usize>().ok()).unwrap_or(0);

    let mut elements = if naxis == 0 { 0 } else { 1 };
    for i in 1..=naxis {
        elements *= header.get_usize(&format!("NAXIS{i}"))?;
    }
    let pcount = header
        .get("PCOUNT")
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(0);

    let data_bytes = bitpix / 8 * elements + pcount;
    *offset = next_block_boundary(*offset + data_bytes);
    Ok(())
}

fn next_block_boundary(pos: usize) -> usize {
    pos.div_ceil(BLOCK_SIZE) * BLOCK_SIZE
}

struct Column {
    name: String,
    dtype: char,
    repeat: usize,
    offset: usize,
}

fn read_table(
    bytes: &[u8],
    data_start: usize,
    header: &Header,
) -> Result<Vec<ProbabilityCell>, CrossmatchError> {
    let row_bytes = header.get_usize("NAXIS1")?;
    let rows = header.get_usize("NAXIS2")?;
    let tfields = header.get_usize("TFIELDS")?;

    let mut columns = Vec::with_capacity(tfields);
    let mut col_offset = 0;
    for i in 1..=tfields {
        let form = header
            .get(&format!("TFORM{i}"))
            .ok_or_else(|| malformed(format!("missing TFORM{i} header")))?;
        let (repeat, dtype) = parse_tform(form)?;
        columns.push(Column {
            name: header
                .get(&format!("TTYPE{i}"))
                .unwrap_or("")
                .trim()
                .to_uppercase(),
            dtype,
            repeat,
            offset: col_offset,
        });
        col_offset += repeat * type_width(dtype)?;
    }
    if col_offset > row_bytes {
        return Err(malformed("table row narrower than its declared columns"));
    }
    if bytes.len() < data_start + row_bytes * rows {
        return Err(malformed("truncated FITS table data"));
    }

    let find = |name: &str| columns.iter().find(|c| c.name == name && c.repeat == 1);

    if let (Some(uniq_col), Some(dens_col)) = (find("UNIQ"), find("PROBDENSITY")) {
        let mut cells = Vec::with_capacity(rows);
        for r in 0..rows {
            let row = data_start + r * row_bytes;
            let uniq = read_int(bytes, row + uniq_col.offset, uniq_col.dtype)?;
            if uniq < 4 {
                return Err(malformed(format!("invalid UNIQ index {uniq}")));
            }
            cells.push(ProbabilityCell {
                uniq: uniq as u64,
                prob_density: read_float(bytes, row + dens_col.offset, dens_col.dtype)?,
            });
        }
        return Ok(cells);
    }

    if let Some(prob_col) = find("PROB").or_else(|| find("PROBABILITY")) {
        let ordering = header.get("ORDERING").unwrap_or("");
        if !ordering.eq_ignore_ascii_case("NESTED") {
            return Err(malformed(format!(
                "unsupported pixel ordering {ordering:?} (only NESTED fixed grids are accepted)"
            )));
        }
        let nside = header.get_usize("NSIDE")?;
        if !nside.is_power_of_two() {
            return Err(malformed(format!("NSIDE {nside} is not a power of two")));
        }
        let order = nside.trailing_zeros() as u64;
        if rows != 12 * nside * nside {
            return Err(malformed(format!(
                "fixed grid has {rows} rows, expected {} for NSIDE {nside}",
                12 * nside * nside
            )));
        }
        let cell_area = 4.0 * std::f64::consts::PI / (12.0 * nside as f64 * nside as f64);
        let mut cells = Vec::with_capacity(rows);
        for ipix in 0..rows {
            let row = data_start + ipix * row_bytes;
            let prob = read_float(bytes, row + prob_col.offset, prob_col.dtype)?;
            cells.push(ProbabilityCell {
                uniq: (1u64 << (2 * order + 2)) + ipix as u64,
                prob_density: prob / cell_area,
            });
        }
        return Ok(cells);
    }

    Err(malformed(
        "table carries neither UNIQ/PROBDENSITY nor PROB columns",
    ))
}

/// Split a TFORM value like `1K` or `D` into repeat count and type code.
fn parse_tform(form: &str) -> Result<(usize, char), CrossmatchError> {
    let form = form.trim();
    let digits: String = form.chars().take_while(|c| c.is_ascii_digit()).collect();
    let repeat = if digits.is_empty() {
        1
    } else {
        digits
            .parse()
            .map_err(|_| malformed(format!("invalid TFORM {form:?}")))?
    };
    let dtype = form[digits.len()..]
        .chars()
        .next()
        .ok_or_else(|| malformed(format!("invalid TFORM {form:?}")))?;
    if dtype == 'P' || dtype == 'Q' {
        return Err(malformed("variable-length table columns are not supported"));
    }
    Ok((repeat, dtype))
}

fn type_width(dtype: char) -> Result<usize, CrossmatchError> {
    match dtype {
        'L' | 'X' | 'B' | 'A' => Ok(1),
        'I' => Ok(2),
        'J' | 'E' => Ok(4),
        'K' | 'D' => Ok(8),
        other => Err(malformed(format!("unsupported column type {other:?}"))),
    }
}

fn be_array<const N: usize>(bytes: &[u8], at: usize) -> Result<[u8; N], CrossmatchError> {
    bytes
        .get(at..at + N)
        .and_then(|s| s.try_into().ok())
        .ok_or_else(|| malformed("table cell out of bounds"))
}

fn read_int(bytes: &[u8], at: usize, dtype: char) -> Result<i64, CrossmatchError> {
    match dtype {
        'I' => Ok(i16::from_be_bytes(be_array(bytes, at)?) as i64),
        'J' => Ok(i32::from_be_bytes(be_array(bytes, at)?) as i64),
        'K' => Ok(i64::from_be_bytes(be_array(bytes, at)?)),
        other => Err(malformed(format!("column type {other:?} is not an integer"))),
    }
}

fn read_float(bytes: &[u8], at: usize, dtype: char) -> Result<f64, CrossmatchError> {
    match dtype {
        'E' => Ok(f32::from_be_bytes(be_array(bytes, at)?) as f64),
        'D' => Ok(f64::from_be_bytes(be_array(bytes, at)?)),
        other => Err(malformed(format!("column type {other:?} is not a float"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header_block(cards: &[String]) -> Vec<u8> {
        let mut out = Vec::new();
        for card in cards {
            let mut buf = card.clone().into_bytes();
            assert!(buf.len() <= CARD_SIZE, "card too long: {card}");
            buf.resize(CARD_SIZE, b' ');
            out.extend(buf);
        }
        let mut end = b"END".to_vec();
        end.resize(CARD_SIZE, b' ');
        out.extend(end);
        out.resize(next_block_boundary(out.len()), b' ');
        out
    }

    fn primary_block() -> Vec<u8> {
        header_block(&[
            "SIMPLE  =                    T".to_string(),
            "BITPIX  =                    8".to_string(),
            "NAXIS   =                    0".to_string(),
        ])
    }

    fn padded(mut data: Vec<u8>) -> Vec<u8> {
        data.resize(next_block_boundary(data.len()), 0);
        data
    }

    fn multiorder_fits(cells: &[(i64, f64)]) -> Vec<u8> {
        let mut out = primary_block();
        out.extend(header_block(&[
            "XTENSION= 'BINTABLE'".to_string(),
            "BITPIX  =                    8".to_string(),
            "NAXIS   =                    2".to_string(),
            "NAXIS1  =                   16".to_string(),
            format!("NAXIS2  = {:>20}", cells.len()),
            "PCOUNT  =                    0".to_string(),
            "GCOUNT  =                    1".to_string(),
            "TFIELDS =                    2".to_string(),
            "TTYPE1  = 'UNIQ    '".to_string(),
            "TFORM1  = 'K       '".to_string(),
            "TTYPE2  = 'PROBDENSITY'".to_string(),
            "TFORM2  = 'D       '".to_string(),
        ]));
        let mut data = Vec::new();
        for (uniq, density) in cells {
            data.extend(uniq.to_be_bytes());
            data.extend(density.to_be_bytes());
        }
        out.extend(padded(data));
        out
    }

    fn fixed_fits(ordering: &str, nside: usize, probs: &[f32]) -> Vec<u8> {
        let mut out = primary_block();
        out.extend(header_block(&[
            "XTENSION= 'BINTABLE'".to_string(),
            "BITPIX  =                    8".to_string(),
            "NAXIS   =                    2".to_string(),
            "NAXIS1  =                    4".to_string(),
            format!("NAXIS2  = {:>20}", probs.len()),
            "PCOUNT  =                    0".to_string(),
            "GCOUNT  =                    1".to_string(),
            "TFIELDS =                    1".to_string(),
            "TTYPE1  = 'PROB    '".to_string(),
            "TFORM1  = 'E       '".to_string(),
            format!("ORDERING= '{ordering}'"),
            format!("NSIDE   = {nside:>20}"),
        ]));
        let mut data = Vec::new();
        for p in probs {
            data.extend(p.to_be_bytes());
        }
        out.extend(padded(data));
        out
    }

    #[test]
    fn test_multiorder_round_trip() {
        // Test: UNIQ/PROBDENSITY rows come back verbatim
        let cells = [(1024i64, 0.25f64), (1025, 0.5), (4100, 0.125)];
        let parsed = read_probability_cells(&multiorder_fits(&cells)).unwrap();
        assert_eq!(parsed.len(), 3);
        for ((uniq, density), cell) in cells.iter().zip(&parsed) {
            assert_eq!(cell.uniq, *uniq as u64);
            assert_eq!(cell.prob_density, *density);
        }
    }

    #[test]
    fn test_fixed_grid_nested_accepted() {
        // Test: a flat NSIDE=1 map becomes 12 cells whose probabilities are
        // converted to densities (prob / cell area)
        let probs = [0.5f32, 0.5, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0];
        let parsed = read_probability_cells(&fixed_fits("NESTED", 1, &probs)).unwrap();
        assert_eq!(parsed.len(), 12);
        // NSIDE=1 is order 0, so uniq = 4 + ipix
        assert_eq!(parsed[0].uniq, 4);
        assert_eq!(parsed[11].uniq, 15);
        let cell_area = 4.0 * std::f64::consts::PI / 12.0;
        assert!((parsed[0].prob_density - 0.5 / cell_area).abs() < 1e-9);
    }

    #[test]
    fn test_ring_ordering_rejected() {
        let probs = [0.0f32; 12];
        let err = read_probability_cells(&fixed_fits("RING", 1, &probs)).unwrap_err();
        assert!(matches!(err, CrossmatchError::MalformedResponse(_)));
    }

    #[test]
    fn test_truncated_data_rejected() {
        let mut file = multiorder_fits(&[(1024, 0.5), (1025, 0.5)]);
        file.truncate(file.len() - BLOCK_SIZE);
        let err = read_probability_cells(&file).unwrap_err();
        assert!(matches!(err, CrossmatchError::MalformedResponse(_)));
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(read_probability_cells(b"not a fits file").is_err());
        assert!(read_probability_cells(&primary_block()).is_err());
    }
}
