//! Range compression for node and rank maps. Node lists compress into
//! `pmix[prefix[width:ranges]suffix,...]`; per-node rank lists into
//! `pmix[a-b,c;d,...]` with semicolons separating nodes. Decompressing a
//! compressed list yields the original for well-formed inputs.

use crate::status::{PmixResult, Status};

struct NodeGroup {
    prefix: String,
    suffix: String,
    width: usize,
    ranges: Vec<(u64, u64)>,
}

/// Splits a node name into (prefix, number, width, suffix). Names without
/// exactly one digit run stay verbatim.
fn split_name(name: &str) -> Option<(String, u64, usize, String)> {
    let bytes = name.as_bytes();
    let digits_start = bytes.iter().position(|b| b.is_ascii_digit())?;
    if !bytes[..digits_start].iter().all(|b| b.is_ascii_alphabetic()) {
        return None;
    }
    let digits_end = digits_start
        + bytes[digits_start..]
            .iter()
            .position(|b| !b.is_ascii_digit())
            .unwrap_or(bytes.len() - digits_start);
    let suffix = &name[digits_end..];
    if suffix.bytes().any(|b| b.is_ascii_digit()) {
        return None;
    }
    let number = name[digits_start..digits_end].parse::<u64>().ok()?;
    Some((
        name[..digits_start].to_string(),
        number,
        digits_end - digits_start,
        suffix.to_string(),
    ))
}

fn push_range(ranges: &mut Vec<(u64, u64)>, value: u64) {
    if let Some(last) = ranges.last_mut() {
        if value == last.1 + 1 {
            last.1 = value;
            return;
        }
    }
    ranges.push((value, value));
}

fn format_ranges(ranges: &[(u64, u64)]) -> String {
    ranges
        .iter()
        .map(|(start, end)| {
            if start == end {
                format!("{}", start)
            } else {
                format!("{}-{}", start, end)
            }
        })
        .collect::<Vec<_>>()
        .join(",")
}

/// Compresses a node-name list. A single name is emitted verbatim;
/// anything longer gets the bracketed range form.
pub fn generate_nodes(names: &[String]) -> String {
    if names.len() == 1 {
        return names[0].clone();
    }

    // Elements keep first-appearance order; consecutive numbers within a
    // (prefix, suffix, width) group collapse into ranges.
    enum Element {
        Group(NodeGroup),
        Verbatim(String),
    }

    let mut elements: Vec<Element> = Vec::new();
    for name in names {
        match split_name(name) {
            None => elements.push(Element::Verbatim(name.clone())),
            Some((prefix, number, width, suffix)) => {
                let found = elements.iter_mut().find_map(|el| match el {
                    Element::Group(g)
                        if g.prefix == prefix && g.suffix == suffix && g.width == width =>
                    {
                        Some(g)
                    }
                    _ => None,
                });
                match found {
                    Some(group) => push_range(&mut group.ranges, number),
                    None => elements.push(Element::Group(NodeGroup {
                        prefix,
                        suffix,
                        width,
                        ranges: vec![(number, number)],
                    })),
                }
            }
        }
    }

    let parts: Vec<String> = elements
        .into_iter()
        .map(|el| match el {
            Element::Verbatim(name) => name,
            Element::Group(g) => format!(
                "{}[{}:{}]{}",
                g.prefix,
                g.width,
                format_ranges(&g.ranges),
                g.suffix
            ),
        })
        .collect();

    format!("pmix[{}]", parts.join(","))
}

/// Splits at top-level separators, ignoring separators inside brackets.
fn split_depth0(input: &str, sep: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    for (idx, ch) in input.char_indices() {
        match ch {
            '[' => depth += 1,
            ']' => depth = depth.saturating_sub(1),
            c if c == sep && depth == 0 => {
                parts.push(&input[start..idx]);
                start = idx + 1;
            }
            _ => {}
        }
    }
    parts.push(&input[start..]);
    parts
}

fn parse_ranges(text: &str) -> PmixResult<Vec<(u64, u64)>> {
    let mut out = Vec::new();
    for tok in text.split(',') {
        if tok.is_empty() {
            return Err(Status::BadParam);
        }
        match tok.find('-') {
            Some(dash) => {
                let start = tok[..dash].parse::<u64>().map_err(|_| Status::BadParam)?;
                let end = tok[dash + 1..].parse::<u64>().map_err(|_| Status::BadParam)?;
                if end < start {
                    return Err(Status::BadParam);
                }
                out.push((start, end));
            }
            None => {
                let val = tok.parse::<u64>().map_err(|_| Status::BadParam)?;
                out.push((val, val));
            }
        }
    }
    Ok(out)
}

/// Decompresses a node map back into the plain name list.
pub fn parse_nodes(regexp: &str) -> PmixResult<Vec<String>> {
    let inner = match strip_wrapper(regexp) {
        Some(inner) => inner,
        None => return Ok(vec![regexp.to_string()]),
    };

    let mut names = Vec::new();
    for element in split_depth0(inner, ',') {
        let open = match element.find('[') {
            None => {
                if element.is_empty() {
                    return Err(Status::BadParam);
                }
                names.push(element.to_string());
                continue;
            }
            Some(open) => open,
        };
        let close = element.rfind(']').ok_or(Status::BadParam)?;
        if close < open {
            return Err(Status::BadParam);
        }
        let prefix = &element[..open];
        let suffix = &element[close + 1..];
        let body = &element[open + 1..close];
        let colon = body.find(':').ok_or(Status::BadParam)?;
        let width = body[..colon].parse::<usize>().map_err(|_| Status::BadParam)?;
        for (start, end) in parse_ranges(&body[colon + 1..])? {
            for num in start..=end {
                names.push(format!("{}{:0width$}{}", prefix, num, suffix, width = width));
            }
        }
    }
    Ok(names)
}

/// Compresses per-node rank lists. A single node emits its plain
/// comma-joined ranks; multiple nodes are semicolon-separated inside the
/// wrapper.
pub fn generate_procs(ranks_per_node: &[Vec<i32>]) -> String {
    let compress_one = |ranks: &[i32]| -> String {
        let mut ranges: Vec<(u64, u64)> = Vec::new();
        for &rank in ranks {
            push_range(&mut ranges, rank as u64);
        }
        format_ranges(&ranges)
    };

    if ranks_per_node.len() == 1 {
        return ranks_per_node[0]
            .iter()
            .map(|r| r.to_string())
            .collect::<Vec<_>>()
            .join(",");
    }

    let parts: Vec<String> = ranks_per_node
        .iter()
        .map(|ranks| compress_one(ranks))
        .collect();
    format!("pmix[{}]", parts.join(";"))
}

/// Decompresses a proc map back into per-node rank lists.
pub fn parse_procs(regexp: &str) -> PmixResult<Vec<Vec<i32>>> {
    let inner = strip_wrapper(regexp).unwrap_or(regexp);
    let mut out = Vec::new();
    for node in split_depth0(inner, ';') {
        if node.is_empty() {
            return Err(Status::BadParam);
        }
        let mut ranks = Vec::new();
        for (start, end) in parse_ranges(node)? {
            for rank in start..=end {
                ranks.push(rank as i32);
            }
        }
        out.push(ranks);
    }
    Ok(out)
}

fn strip_wrapper(input: &str) -> Option<&str> {
    if input.starts_with("pmix[") && input.ends_with(']') {
        Some(&input["pmix[".len()..input.len() - 1])
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_single_name_verbatim() {
        let list = names(&["frontend"]);
        let regex = generate_nodes(&list);
        assert_eq!(regex, "frontend");
        assert_eq!(parse_nodes(&regex).unwrap(), list);
    }

    #[test]
    fn test_range_with_gap() {
        let list = names(&["node01", "node02", "node03", "node05"]);
        let regex = generate_nodes(&list);
        assert_eq!(regex, "pmix[node[2:1-3,5]]");
        assert_eq!(parse_nodes(&regex).unwrap(), list);
    }

    #[test]
    fn test_zero_padding_preserved() {
        let list = names(&["n001", "n002", "n010"]);
        let regex = generate_nodes(&list);
        assert_eq!(parse_nodes(&regex).unwrap(), list);
    }

    #[test]
    fn test_mixed_widths_group_separately() {
        let list = names(&["node1", "node2", "node01", "node02"]);
        let regex = generate_nodes(&list);
        assert_eq!(parse_nodes(&regex).unwrap(), list);
    }

    #[test]
    fn test_uncompressible_names() {
        let list = names(&["login-a", "login-b", "worker7"]);
        let regex = generate_nodes(&list);
        assert_eq!(parse_nodes(&regex).unwrap(), list);
    }

    #[test]
    fn test_suffix_names() {
        let list = names(&["n1east", "n2east", "n3east"]);
        let regex = generate_nodes(&list);
        assert_eq!(regex, "pmix[n[1:1-3]east]");
        assert_eq!(parse_nodes(&regex).unwrap(), list);
    }

    #[test]
    fn test_procs_single_node() {
        let ranks = vec![vec![0, 1, 2, 3]];
        let regex = generate_procs(&ranks);
        assert_eq!(regex, "0,1,2,3");
        assert_eq!(parse_procs(&regex).unwrap(), ranks);
    }

    #[test]
    fn test_procs_multi_node_ranges() {
        let ranks = vec![vec![0, 1, 2], vec![3, 4, 5], vec![8]];
        let regex = generate_procs(&ranks);
        assert_eq!(regex, "pmix[0-2;3-5;8]");
        assert_eq!(parse_procs(&regex).unwrap(), ranks);
    }

    #[test]
    fn test_procs_discontiguous() {
        let ranks = vec![vec![0, 2, 4], vec![1, 3, 5]];
        let regex = generate_procs(&ranks);
        assert_eq!(parse_procs(&regex).unwrap(), ranks);
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(parse_nodes("pmix[node[2:]]").is_err());
        assert!(parse_nodes("pmix[node[x:1-2]]").is_err());
        assert!(parse_procs("pmix[1-]").is_err());
        assert!(parse_procs("pmix[3-1]").is_err());
    }
}
