//! Writers for synthetic FITS files used throughout the unit tests.

use ndarray::Array2;

use crate::fits::{BLOCK_SIZE, CARD_SIZE, Header, HeaderValue};

/// Format one 80-character header card.
pub(crate) fn card(key: &str, value: impl Into<HeaderValue>) -> String {
    let value = match value.into() {
        HeaderValue::String(s) => format!("{:<20}", format!("'{:<8}'", s.replace('\'', "''"))),
        HeaderValue::Float(f) => format!("{:>20}", format!("{f:.15E}")),
        other => format!("{:>20}", other.to_string()),
    };
    let mut card = format!("{key:<8}= {value}");
    card.truncate(CARD_SIZE);
    format!("{card:<80}")
}

fn push_padded(bytes: &mut Vec<u8>, fill: u8) {
    let len = bytes.len().div_ceil(BLOCK_SIZE) * BLOCK_SIZE;
    bytes.resize(len, fill);
}

/// Incrementally assembles a FITS byte stream.
#[derive(Default)]
pub(crate) struct FitsBuilder {
    bytes: Vec<u8>,
    hdus: usize,
}

impl FitsBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a unit from literal cards and raw data.
    pub fn raw(mut self, cards: Vec<String>, data: &[u8]) -> Self {
        for card in cards {
            self.bytes.extend_from_slice(card.as_bytes());
        }
        self.bytes.extend_from_slice(format!("{:<80}", "END").as_bytes());
        push_padded(&mut self.bytes, b' ');
        self.bytes.extend_from_slice(data);
        push_padded(&mut self.bytes, 0);
        self.hdus += 1;
        self
    }

    fn structural(&self, bitpix: i64, axes: &[usize]) -> Vec<String> {
        let mut cards = if self.hdus == 0 {
            vec![card("SIMPLE", true)]
        } else {
            vec![card("XTENSION", "IMAGE")]
        };
        cards.push(card("BITPIX", bitpix));
        cards.push(card("NAXIS", axes.len()));
        for (n, len) in axes.iter().enumerate() {
            cards.push(card(&format!("NAXIS{}", n + 1), *len));
        }
        if self.hdus > 0 {
            cards.push(card("PCOUNT", 0));
            cards.push(card("GCOUNT", 1));
        }
        cards
    }

    fn user_cards(header: &Header) -> impl Iterator<Item = String> + '_ {
        header.iter().map(|(k, v)| card(k, v.clone()))
    }

    /// Append a unit without data.
    pub fn empty_primary(self, header: Header) -> Self {
        let mut cards = self.structural(8, &[]);
        cards.extend(Self::user_cards(&header));
        self.raw(cards, &[])
    }

    /// Append a `BITPIX = -32` image.
    pub fn image(self, header: Header, data: &Array2<f32>) -> Self {
        let (rows, cols) = data.dim();
        let mut cards = self.structural(-32, &[cols, rows]);
        cards.extend(Self::user_cards(&header));
        let samples: Vec<u8> = data.iter().flat_map(|v| v.to_be_bytes()).collect();
        self.raw(cards, &samples)
    }

    pub fn build(self) -> Vec<u8> {
        self.bytes
    }
}
