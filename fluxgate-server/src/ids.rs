use rand::{distr::Alphanumeric, Rng};

pub const PUBLIC_ID_LEN: usize = 10;

/// Random public id for an uploaded image. Not cryptographically significant;
/// collisions are treated as negligible and not handled.
pub fn public_id() -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(PUBLIC_ID_LEN)
        .map(char::from)
        .collect()
}
