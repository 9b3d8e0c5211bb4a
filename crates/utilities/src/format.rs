use std::fmt;

/// Prints an integer with a comma between every group of three digits, for
/// the counters in the heap metrics.
pub struct LargeFormatter<T: ToString>(pub T);

impl<T: ToString> fmt::Display for LargeFormatter<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = self.0.to_string();
        let (sign, digits) = match text.strip_prefix('-') {
            Some(digits) => ("-", digits),
            None => ("", text.as_str()),
        };

        f.write_str(sign)?;
        let leading = match digits.len() % 3 {
            0 => 3.min(digits.len()),
            leading => leading,
        };
        f.write_str(&digits[..leading])?;

        for group in digits.as_bytes()[leading..].chunks(3) {
            f.write_str(",")?;
            for &digit in group {
                write!(f, "{}", digit as char)?;
            }
        }

        Ok(())
    }
}

/// Prints a number of bytes in binary units.
pub struct BytesFormatter(pub usize);

impl fmt::Display for BytesFormatter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const UNITS: [&str; 4] = ["KiB", "MiB", "GiB", "TiB"];

        if self.0 < 1024 {
            return write!(f, "{} bytes", self.0);
        }

        let mut value = self.0 as f64 / 1024.0;
        let mut unit = 0;
        while value >= 1024.0 && unit + 1 < UNITS.len() {
            value /= 1024.0;
            unit += 1;
        }

        write!(f, "{value:.2} {}", UNITS[unit])
    }
}
