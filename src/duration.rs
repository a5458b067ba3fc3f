use chrono::Duration;

/// Parser and formatter for the `<n>y <n>d <n>h <n>m` duration syntax used
/// by the cache filter flags. Components may appear in any order and any of
/// them may be omitted; whitespace is ignored.
#[derive(Debug, Clone)]
pub struct DurationParser;

enum Token {
    Number(i64),
    Unit(char),
}

impl DurationParser {
    pub fn parse(input: &str) -> crate::Result<Duration> {
        let tokens = Self::tokenize(input)?;

        let mut total = Duration::zero();
        let mut cur_num: i64 = 0;

        for token in tokens {
            match token {
                Token::Number(n) => cur_num = n,
                Token::Unit(u) => {
                    total = total
                        + match u {
                            'y' => Duration::days(cur_num * 365),
                            'd' => Duration::days(cur_num),
                            'h' => Duration::hours(cur_num),
                            'm' => Duration::minutes(cur_num),
                            _ => unreachable!("tokenizer only emits ydhm"),
                        };
                }
            }
        }

        Ok(total)
    }

    fn tokenize(input: &str) -> crate::Result<Vec<Token>> {
        let mut tokens = Vec::new();
        let mut cur_num = String::new();

        for c in input.chars() {
            match c {
                '0'..='9' => cur_num.push(c),
                'y' | 'd' | 'h' | 'm' => {
                    if cur_num.is_empty() {
                        return Err(crate::DoomsdayError::invalid_input(
                            "unit specifier found without number",
                        ));
                    }

                    let n: i64 = cur_num.parse().map_err(|e| {
                        crate::DoomsdayError::invalid_input(format!("invalid number: {}", e))
                    })?;
                    tokens.push(Token::Number(n));
                    tokens.push(Token::Unit(c));
                    cur_num.clear();
                }
                c if c.is_whitespace() => {}
                c => {
                    return Err(crate::DoomsdayError::invalid_input(format!(
                        "unrecognized token `{}' in duration",
                        c
                    )))
                }
            }
        }

        Ok(tokens)
    }

    /// Inverse of parse. Minutes are always present so that sub-minute
    /// durations still render as something.
    pub fn format(dur: Duration) -> String {
        let mut parts = Vec::new();

        if dur >= Duration::days(365) {
            parts.push(format!("{}y", dur.num_days() / 365));
        }

        if dur >= Duration::days(1) {
            parts.push(format!("{}d", dur.num_days() % 365));
        }

        if dur >= Duration::hours(1) {
            parts.push(format!("{}h", dur.num_hours() % 24));
        }

        parts.push(format!("{}m", dur.num_minutes() % 60));
        parts.join(" ")
    }
}
