use std::ops::RangeInclusive;

use pest::Parser;

use crate::{Error, Field};

const MAX_EMAIL_LEN: usize = 254;
const MAX_EMAIL_LOCAL_PART_LEN: usize = 64;

#[derive(pest_derive::Parser)]
#[grammar = "email.pest"]
struct EmailParser;

// Postgres refuses NUL bytes in text columns, so every string that may reach the
// database goes through here first
pub fn validate_string(s: &str) -> Result<(), Error> {
    match s.contains('\0') {
        true => Err(Error::NullByteInString(String::from(s))),
        false => Ok(()),
    }
}

/// Lengths are counted in characters, not bytes
pub fn validate_length(
    field: Field,
    s: &str,
    allowed: RangeInclusive<usize>,
) -> Result<(), Error> {
    let len = s.chars().count();
    if allowed.contains(&len) {
        return Ok(());
    }
    Err(Error::invalid(
        field,
        format!(
            "must be between {} and {} characters long",
            allowed.start(),
            allowed.end()
        ),
    ))
}

pub fn validate_email(s: &str) -> Result<(), Error> {
    validate_string(s)?;
    let invalid = || Error::invalid(Field::AuthorEmail, "must be a valid email address");
    if s.len() > MAX_EMAIL_LEN {
        return Err(invalid());
    }
    let local_len = s.split('@').next().map(str::len).unwrap_or(0);
    if local_len > MAX_EMAIL_LOCAL_PART_LEN {
        return Err(invalid());
    }
    EmailParser::parse(Rule::email, s).map_err(|_| invalid())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn common_addresses() {
        for ok in [
            "reader@example.com",
            "first.last@mail.example.co.uk",
            "tag+news@example.org",
            "o'brien@example-shop.de",
            "x@a-b--c.io",
        ] {
            assert_eq!(validate_email(ok), Ok(()), "{ok}");
        }
    }

    #[test]
    fn malformed_addresses() {
        for bad in [
            "",
            "plainaddress",
            "@example.com",
            "reader@",
            "reader@localhost",
            "reader@example.c",
            "reader@example.c0m",
            "reader@-example.com",
            "reader@example-.com",
            "reader..dots@example.com",
            ".reader@example.com",
            "reader.@example.com",
            "two@@example.com",
            "spaces in@example.com",
            "reader@example.com ",
        ] {
            assert!(validate_email(bad).is_err(), "{bad:?} should be refused");
        }
    }

    #[test]
    fn overlong_local_part() {
        let addr = format!("{}@example.com", "a".repeat(MAX_EMAIL_LOCAL_PART_LEN + 1));
        assert!(validate_email(&addr).is_err());
    }

    #[test]
    fn length_counts_characters() {
        // 10 characters, 20 bytes
        assert_eq!(validate_length(Field::Body, "éééééééééé", 10..=2000), Ok(()));
        assert_eq!(
            validate_length(Field::Body, "123456789", 10..=2000),
            Err(Error::invalid(
                Field::Body,
                "must be between 10 and 2000 characters long"
            ))
        );
    }

    #[test]
    fn fuzz_validation_never_panics() {
        bolero::check!().with_type::<String>().for_each(|s| {
            let _ = validate_email(s);
            let _ = validate_length(Field::AuthorName, s, 2..=50);
            if s.contains('\0') {
                assert!(validate_string(s).is_err());
            }
        });
    }
}
