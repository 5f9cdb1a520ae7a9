//! SDP text parsing
//!
//! Every SDP line has the form `<type>=<value>`. Lines are split with nom,
//! then folded into the session or the current media section. Line types the
//! negotiation policy does not use (`i=`, `u=`, `b=`, `t=`, `r=`, `z=`, `k=`...)
//! are skipped rather than rejected.

use nom::{
    IResult,
    bytes::complete::{tag, take_till1, take_while1},
    character::complete::{anychar, char, digit1, not_line_ending, space1},
    combinator::{map_res, opt, rest},
    multi::many0,
    sequence::{preceded, tuple},
};

use super::{Attribute, Connection, MediaDescription, Origin, SdpError, SessionDescription};

fn token(input: &str) -> IResult<&str, &str> {
    take_while1(|c: char| !c.is_ascii_whitespace())(input)
}

/// `x=value`
pub(crate) fn sdp_line(input: &str) -> IResult<&str, (char, &str)> {
    let (input, key) = anychar(input)?;
    let (input, _) = char('=')(input)?;
    let (input, value) = not_line_ending(input)?;
    Ok((input, (key, value.trim())))
}

/// `<username> <sess-id> <sess-version> IN <addrtype> <address>`
fn origin_line(input: &str) -> IResult<&str, Origin> {
    let (input, (username, _, session_id, _, session_version, _, _, _, _, _, address)) =
        tuple((
            token,
            space1,
            map_res(digit1, str::parse::<u64>),
            space1,
            map_res(digit1, str::parse::<u64>),
            space1,
            tag("IN"),
            space1,
            token,
            space1,
            token,
        ))(input)?;
    Ok((
        input,
        Origin {
            username: username.to_string(),
            session_id,
            session_version,
            address: address.to_string(),
        },
    ))
}

/// `IN <addrtype> <address>[/ttl]`
fn connection_line(input: &str) -> IResult<&str, Connection> {
    let (input, (_, _, _, _, address)) =
        tuple((tag("IN"), space1, token, space1, take_till1(|c: char| c == '/' || c.is_ascii_whitespace())))(
            input,
        )?;
    Ok((input, Connection::new(address)))
}

/// `<media> <port>[/<count>] <proto> <fmt> ...`
fn media_line(input: &str) -> IResult<&str, (&str, &str, &str, Vec<&str>)> {
    let (input, (media, _, port, _count, _, proto, formats)) = tuple((
        token,
        space1,
        digit1,
        opt(preceded(char('/'), digit1)),
        space1,
        token,
        many0(preceded(space1, token)),
    ))(input)?;
    Ok((input, (media, port, proto, formats)))
}

/// `name[:value]`
fn attribute_line(input: &str) -> IResult<&str, Attribute> {
    let (input, name) = take_while1(|c: char| c != ':')(input)?;
    let (input, value) = opt(preceded(char(':'), rest))(input)?;
    Ok((
        input,
        Attribute {
            name: name.trim().to_string(),
            value: value.map(|v| v.trim().to_string()),
        },
    ))
}

fn invalid(line_type: char, line: &str) -> SdpError {
    SdpError::InvalidLine { line_type, line: line.to_string() }
}

/// Parse a complete SDP body
pub fn parse_session_description(text: &str) -> Result<SessionDescription, SdpError> {
    let mut lines = text
        .lines()
        .map(|l| l.trim_end_matches('\r'))
        .filter(|l| !l.trim().is_empty());

    match lines.next().map(sdp_line) {
        Some(Ok((_, ('v', _)))) => {}
        _ => return Err(SdpError::MissingVersion),
    }

    let mut sdp = SessionDescription {
        origin: Origin::new(0, "0.0.0.0"),
        session_name: "-".to_string(),
        connection: None,
        attributes: Vec::new(),
        media: Vec::new(),
    };

    for line in lines {
        let (_, (line_type, value)) = sdp_line(line).map_err(|_| invalid('?', line))?;
        match line_type {
            'o' => {
                let (_, origin) = origin_line(value).map_err(|_| invalid('o', line))?;
                sdp.origin = origin;
            }
            's' => sdp.session_name = value.to_string(),
            'c' => {
                let (_, conn) = connection_line(value).map_err(|_| invalid('c', line))?;
                match sdp.media.last_mut() {
                    Some(md) => md.connection = Some(conn),
                    None => sdp.connection = Some(conn),
                }
            }
            'm' => {
                let (_, (media, port, proto, formats)) =
                    media_line(value).map_err(|_| invalid('m', line))?;
                let port: u16 = port.parse().map_err(|_| SdpError::InvalidPort(port.to_string()))?;
                let mut md = MediaDescription::new(media, port, proto);
                md.formats = formats.into_iter().map(str::to_string).collect();
                sdp.media.push(md);
            }
            'a' => {
                let (_, attr) = attribute_line(value).map_err(|_| invalid('a', line))?;
                match sdp.media.last_mut() {
                    Some(md) => md.attributes.push(attr),
                    None => sdp.attributes.push(attr),
                }
            }
            _ => {}
        }
    }

    Ok(sdp)
}
