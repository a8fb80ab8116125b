// SPDX-License-Identifier: Apache-2.0

//! Transfer-list parsing. One header line
//! (`version total_blocks stash_max command_count`), then one command per
//! line. Hashes are hex sha-256; block sets use the counted text form.

use crate::blockset::BlockSet;
use crate::error::{Result, UpdateError};

pub const TRANSFER_LIST_VERSION: u32 = 1;

fn invalid(msg: impl Into<String>) -> UpdateError {
    UpdateError::ProgramInvalid(msg.into())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Move {
        hash: [u8; 32],
        target: BlockSet,
        source: BlockSet,
    },
    Bsdiff {
        patch_start: u64,
        patch_len: u64,
        src_hash: [u8; 32],
        dst_hash: [u8; 32],
        target: BlockSet,
        source: BlockSet,
    },
    ImgDiff {
        patch_start: u64,
        patch_len: u64,
        src_hash: [u8; 32],
        dst_hash: [u8; 32],
        target: BlockSet,
        source: BlockSet,
    },
    New {
        target: BlockSet,
    },
    Zero {
        target: BlockSet,
    },
    Erase {
        target: BlockSet,
    },
    Stash {
        hash: [u8; 32],
        source: BlockSet,
    },
    Free {
        hash: [u8; 32],
    },
}

impl Command {
    /// Blocks this command writes to the target; progress advances by this.
    pub fn written_blocks(&self) -> u64 {
        match self {
            Command::Move { target, .. }
            | Command::Bsdiff { target, .. }
            | Command::ImgDiff { target, .. }
            | Command::New { target }
            | Command::Zero { target }
            | Command::Erase { target } => target.block_count(),
            Command::Stash { .. } | Command::Free { .. } => 0,
        }
    }

    /// The source set a patch-style command reads, if any. Stash consumers
    /// are counted by matching these against the stashed set.
    pub fn source_set(&self) -> Option<&BlockSet> {
        match self {
            Command::Move { source, .. }
            | Command::Bsdiff { source, .. }
            | Command::ImgDiff { source, .. } => Some(source),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TransferList {
    pub version: u32,
    pub total_blocks: u64,
    pub stash_max: u64,
    pub commands: Vec<Command>,
}

fn parse_hash(token: &str) -> Result<[u8; 32]> {
    let raw = hex::decode(token).map_err(|_| invalid(format!("bad hash {:?}", token)))?;
    raw.try_into()
        .map_err(|_| invalid(format!("hash {:?} is not 32 bytes", token)))
}

fn parse_u64(token: &str) -> Result<u64> {
    token
        .parse()
        .map_err(|_| invalid(format!("bad integer {:?}", token)))
}

struct Fields<'a> {
    line_no: usize,
    tokens: std::str::SplitWhitespace<'a>,
}

impl<'a> Fields<'a> {
    fn next(&mut self) -> Result<&'a str> {
        self.tokens
            .next()
            .ok_or_else(|| invalid(format!("line {}: missing field", self.line_no)))
    }

    fn finish(mut self) -> Result<()> {
        match self.tokens.next() {
            Some(extra) => Err(invalid(format!(
                "line {}: trailing field {:?}",
                self.line_no, extra
            ))),
            None => Ok(()),
        }
    }
}

impl TransferList {
    pub fn parse(text: &str) -> Result<Self> {
        let mut lines = text.lines().enumerate();
        let (_, header) = lines
            .next()
            .ok_or_else(|| invalid("empty transfer list"))?;
        let fields: Vec<&str> = header.split_whitespace().collect();
        if fields.len() != 4 {
            return Err(invalid(format!(
                "header has {} fields, expected 4",
                fields.len()
            )));
        }
        let version = parse_u64(fields[0])? as u32;
        if version != TRANSFER_LIST_VERSION {
            return Err(invalid(format!("unsupported version {}", version)));
        }
        let total_blocks = parse_u64(fields[1])?;
        let stash_max = parse_u64(fields[2])?;
        let command_count = parse_u64(fields[3])? as usize;

        let mut commands = Vec::with_capacity(command_count);
        for (index, line) in lines {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            commands.push(Self::parse_command(line, index + 1)?);
        }
        if commands.len() != command_count {
            return Err(invalid(format!(
                "header declares {} commands, found {}",
                command_count,
                commands.len()
            )));
        }

        let list = Self {
            version,
            total_blocks,
            stash_max,
            commands,
        };
        list.validate()?;
        Ok(list)
    }

    fn parse_command(line: &str, line_no: usize) -> Result<Command> {
        let mut fields = Fields {
            line_no,
            tokens: line.split_whitespace(),
        };
        let op = fields.next()?;
        let command = match op {
            "move" => {
                let hash = parse_hash(fields.next()?)?;
                let target = BlockSet::parse(fields.next()?)?;
                let count = parse_u64(fields.next()?)?;
                let source = BlockSet::parse(fields.next()?)?;
                if count != target.block_count() || count != source.block_count() {
                    return Err(invalid(format!(
                        "line {}: move count {} does not match sets",
                        line_no, count
                    )));
                }
                Command::Move {
                    hash,
                    target,
                    source,
                }
            }
            "bsdiff" | "imgdiff" => {
                let patch_start = parse_u64(fields.next()?)?;
                let patch_len = parse_u64(fields.next()?)?;
                let src_hash = parse_hash(fields.next()?)?;
                let dst_hash = parse_hash(fields.next()?)?;
                let target = BlockSet::parse(fields.next()?)?;
                let count = parse_u64(fields.next()?)?;
                let source = BlockSet::parse(fields.next()?)?;
                if count != target.block_count() {
                    return Err(invalid(format!(
                        "line {}: {} count {} does not match target",
                        line_no, op, count
                    )));
                }
                if op == "bsdiff" {
                    Command::Bsdiff {
                        patch_start,
                        patch_len,
                        src_hash,
                        dst_hash,
                        target,
                        source,
                    }
                } else {
                    Command::ImgDiff {
                        patch_start,
                        patch_len,
                        src_hash,
                        dst_hash,
                        target,
                        source,
                    }
                }
            }
            "new" => Command::New {
                target: BlockSet::parse(fields.next()?)?,
            },
            "zero" => Command::Zero {
                target: BlockSet::parse(fields.next()?)?,
            },
            "erase" => Command::Erase {
                target: BlockSet::parse(fields.next()?)?,
            },
            "stash" => {
                let hash = parse_hash(fields.next()?)?;
                let source = BlockSet::parse(fields.next()?)?;
                Command::Stash { hash, source }
            }
            "free" => Command::Free {
                hash: parse_hash(fields.next()?)?,
            },
            other => {
                return Err(invalid(format!(
                    "line {}: unknown command {:?}",
                    line_no, other
                )));
            }
        };
        fields.finish()?;
        Ok(command)
    }

    fn validate(&self) -> Result<()> {
        let written: u64 = self.commands.iter().map(|c| c.written_blocks()).sum();
        if written > self.total_blocks {
            return Err(invalid(format!(
                "commands write {} blocks, header declares {}",
                written, self.total_blocks
            )));
        }
        let mut live_stash_blocks = 0u64;
        let mut peak = 0u64;
        for command in &self.commands {
            match command {
                Command::Stash { source, .. } => {
                    live_stash_blocks += source.block_count();
                    peak = peak.max(live_stash_blocks);
                }
                Command::Free { hash } => {
                    // size bookkeeping only; existence is checked at run time
                    if let Some(Command::Stash { source, .. }) =
                        self.commands.iter().find(|c| matches!(c, Command::Stash { hash: h, .. } if h == hash))
                    {
                        live_stash_blocks = live_stash_blocks.saturating_sub(source.block_count());
                    }
                }
                _ => {}
            }
        }
        if peak > self.stash_max {
            return Err(invalid(format!(
                "stash peak {} blocks exceeds declared max {}",
                peak, self.stash_max
            )));
        }
        Ok(())
    }

    /// Consumers a stash at `index` must serve before its free: later
    /// patch-style commands reading exactly the stashed set, up to the
    /// matching free.
    pub fn declared_consumers(&self, index: usize) -> u32 {
        let Command::Stash { hash, source } = &self.commands[index] else {
            return 0;
        };
        let mut count = 0u32;
        for command in &self.commands[index + 1..] {
            match command {
                Command::Free { hash: h } if h == hash => break,
                other => {
                    if other.source_set() == Some(source) {
                        count += 1;
                    }
                }
            }
        }
        count
    }

    pub fn encode(&self) -> String {
        let mut out = format!(
            "{} {} {} {}\n",
            self.version,
            self.total_blocks,
            self.stash_max,
            self.commands.len()
        );
        for command in &self.commands {
            match command {
                Command::Move {
                    hash,
                    target,
                    source,
                } => {
                    out.push_str(&format!(
                        "move {} {} {} {}\n",
                        hex::encode(hash),
                        target.to_text(),
                        target.block_count(),
                        source.to_text()
                    ));
                }
                Command::Bsdiff {
                    patch_start,
                    patch_len,
                    src_hash,
                    dst_hash,
                    target,
                    source,
                } => {
                    out.push_str(&format!(
                        "bsdiff {} {} {} {} {} {} {}\n",
                        patch_start,
                        patch_len,
                        hex::encode(src_hash),
                        hex::encode(dst_hash),
                        target.to_text(),
                        target.block_count(),
                        source.to_text()
                    ));
                }
                Command::ImgDiff {
                    patch_start,
                    patch_len,
                    src_hash,
                    dst_hash,
                    target,
                    source,
                } => {
                    out.push_str(&format!(
                        "imgdiff {} {} {} {} {} {} {}\n",
                        patch_start,
                        patch_len,
                        hex::encode(src_hash),
                        hex::encode(dst_hash),
                        target.to_text(),
                        target.block_count(),
                        source.to_text()
                    ));
                }
                Command::New { target } => {
                    out.push_str(&format!("new {}\n", target.to_text()));
                }
                Command::Zero { target } => {
                    out.push_str(&format!("zero {}\n", target.to_text()));
                }
                Command::Erase { target } => {
                    out.push_str(&format!("erase {}\n", target.to_text()));
                }
                Command::Stash { hash, source } => {
                    out.push_str(&format!(
                        "stash {} {}\n",
                        hex::encode(hash),
                        source.to_text()
                    ));
                }
                Command::Free { hash } => {
                    out.push_str(&format!("free {}\n", hex::encode(hash)));
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const H0: &str = "0000000000000000000000000000000000000000000000000000000000000000";

    #[test]
    fn parses_header_and_commands() {
        let text = format!(
            "1 10 4 4\nnew 2,0,2\nzero 2,2,4\nstash {} 2,4,6\nfree {}\n",
            H0, H0
        );
        let list = TransferList::parse(&text).unwrap();
        assert_eq!(list.version, 1);
        assert_eq!(list.total_blocks, 10);
        assert_eq!(list.stash_max, 4);
        assert_eq!(list.commands.len(), 4);
        assert!(matches!(list.commands[0], Command::New { .. }));
        assert!(matches!(list.commands[3], Command::Free { .. }));
    }

    #[test]
    fn rejects_bad_headers() {
        assert!(TransferList::parse("").is_err());
        assert!(TransferList::parse("1 10 0\nnew 2,0,2\n").is_err());
        assert!(TransferList::parse("2 10 0 1\nnew 2,0,2\n").is_err());
        // declared command count mismatch
        assert!(TransferList::parse("1 10 0 2\nnew 2,0,2\n").is_err());
    }

    #[test]
    fn rejects_unknown_and_malformed_commands() {
        assert!(TransferList::parse("1 10 0 1\nfrobnicate 2,0,2\n").is_err());
        assert!(TransferList::parse("1 10 0 1\nnew\n").is_err());
        assert!(TransferList::parse("1 10 0 1\nnew 2,0,2 extra\n").is_err());
        let text = format!("1 10 0 1\nmove {} 2,0,2 3 2,4,6\n", H0);
        assert!(TransferList::parse(&text).is_err(), "count mismatch");
    }

    #[test]
    fn stash_budget_enforced() {
        let text = format!("1 10 1 1\nstash {} 2,0,4\n", H0);
        assert!(TransferList::parse(&text).is_err());
        let text = format!("1 10 4 1\nstash {} 2,0,4\n", H0);
        assert!(TransferList::parse(&text).is_ok());
    }

    #[test]
    fn consumer_prescan_counts_until_free() {
        let h1 = "11".repeat(32);
        let text = format!(
            "1 20 4 5\n\
             stash {h} 2,0,2\n\
             move {h} 2,10,12 2 2,0,2\n\
             bsdiff 0 8 {h} {h} 2,12,14 2 2,0,2\n\
             free {h}\n\
             move {h} 2,14,16 2 2,0,2\n",
            h = h1
        );
        let list = TransferList::parse(&text).unwrap();
        // two consumers before the free; the move after the free is not one
        assert_eq!(list.declared_consumers(0), 2);
    }

    #[test]
    fn encode_parse_roundtrip() {
        let text = format!(
            "1 10 2 3\nnew 2,0,2\nstash {} 2,4,6\nfree {}\n",
            H0, H0
        );
        let list = TransferList::parse(&text).unwrap();
        let again = TransferList::parse(&list.encode()).unwrap();
        assert_eq!(again.commands, list.commands);
    }
}
