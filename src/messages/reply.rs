//! Reply messages received from the server

use bytes::Bytes;

use crate::buffer::{ReadBuffer, WriteBuffer};
use crate::constants::code_point as cp;
use crate::exception::{SqlException, SqlResult};
use crate::types::Value;

use super::{read_objects, DdmObject};

/// Severity code sent with reply messages that report success
const SVRCOD_INFO: u16 = 0;

/// A reply the server can send
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// EXCSATRD
    ServerAttributes {
        server_name: String,
        product_release: String,
    },
    /// ACCSECRD: the accepted mechanism (or the supported list when the
    /// proposal was refused) and the server token
    SecurityAccepted {
        mechanisms: Vec<u16>,
        token: Option<Vec<u8>>,
    },
    /// SECCHKRM: zero check code means the credentials were accepted
    SecurityChecked {
        check_code: u8,
        sqlcard: Option<Bytes>,
    },
    /// ACCRDBRM
    RdbAccessed { sqlcard: Option<Bytes> },
    /// SQLCARD with optional returned data
    Sql {
        sqlcard: Option<Bytes>,
        values: Vec<Value>,
    },
    /// ENDUOWRM after commit or rollback
    EndUnitOfWork { sqlcard: Option<Bytes> },
}

impl Reply {
    /// Reply carrying only a diagnostic
    pub fn sql(sqlcard: Option<Bytes>) -> Self {
        Reply::Sql {
            sqlcard,
            values: Vec::new(),
        }
    }

    /// The raw SQLCA sent with this reply, if any
    pub fn sqlcard(&self) -> Option<&Bytes> {
        match self {
            Reply::SecurityChecked { sqlcard, .. }
            | Reply::RdbAccessed { sqlcard }
            | Reply::Sql { sqlcard, .. }
            | Reply::EndUnitOfWork { sqlcard } => sqlcard.as_ref(),
            Reply::ServerAttributes { .. } | Reply::SecurityAccepted { .. } => None,
        }
    }

    /// Short name for logging
    pub fn name(&self) -> &'static str {
        match self {
            Reply::ServerAttributes { .. } => "EXCSATRD",
            Reply::SecurityAccepted { .. } => "ACCSECRD",
            Reply::SecurityChecked { .. } => "SECCHKRM",
            Reply::RdbAccessed { .. } => "ACCRDBRM",
            Reply::Sql { .. } => "SQLCARD",
            Reply::EndUnitOfWork { .. } => "ENDUOWRM",
        }
    }

    /// Encode as DDM objects, as a server would
    pub fn encode(&self) -> Bytes {
        let mut buf = WriteBuffer::new();
        match self {
            Reply::ServerAttributes {
                server_name,
                product_release,
            } => {
                buf.begin_ddm(cp::EXCSATRD);
                buf.write_ddm_param(cp::SRVNAM, server_name.as_bytes());
                buf.write_ddm_param(cp::SRVRLSLV, product_release.as_bytes());
                buf.end_ddm();
            }
            Reply::SecurityAccepted { mechanisms, token } => {
                buf.begin_ddm(cp::ACCSECRD);
                buf.begin_ddm(cp::SECMEC);
                for mechanism in mechanisms {
                    buf.write_u16(*mechanism);
                }
                buf.end_ddm();
                if let Some(token) = token {
                    buf.write_ddm_param(cp::SECTKN, token);
                }
                buf.end_ddm();
            }
            Reply::SecurityChecked {
                check_code,
                sqlcard,
            } => {
                buf.begin_ddm(cp::SECCHKRM);
                buf.write_ddm_u16(cp::SVRCOD, SVRCOD_INFO);
                buf.write_ddm_param(cp::SECCHKCD, &[*check_code]);
                buf.end_ddm();
                write_sqlcard(&mut buf, sqlcard);
            }
            Reply::RdbAccessed { sqlcard } => {
                buf.begin_ddm(cp::ACCRDBRM);
                buf.write_ddm_u16(cp::SVRCOD, SVRCOD_INFO);
                buf.end_ddm();
                write_sqlcard(&mut buf, sqlcard);
            }
            Reply::EndUnitOfWork { sqlcard } => {
                buf.begin_ddm(cp::ENDUOWRM);
                buf.write_ddm_u16(cp::SVRCOD, SVRCOD_INFO);
                buf.end_ddm();
                write_sqlcard(&mut buf, sqlcard);
            }
            Reply::Sql { sqlcard, values } => {
                match sqlcard {
                    Some(card) => buf.write_ddm_param(cp::SQLCARD, card),
                    None => buf.write_ddm_param(cp::SQLCARD, &[0xFF]),
                }
                if !values.is_empty() {
                    buf.begin_ddm(cp::SQLDTARD);
                    buf.write_u16(values.len() as u16);
                    for value in values {
                        value.encode(&mut buf);
                    }
                    buf.end_ddm();
                }
            }
        }
        buf.freeze()
    }

    /// Decode the DDM objects of one reply DSS
    pub fn decode(data: Bytes) -> SqlResult<Self> {
        let objects = read_objects(data)?;
        let (first, rest) = objects
            .split_first()
            .ok_or_else(|| SqlException::protocol("empty reply"))?;
        let sqlcard = find_sqlcard(rest);

        let reply = match first.code_point {
            cp::EXCSATRD => Reply::ServerAttributes {
                server_name: param_text(first, cp::SRVNAM)?,
                product_release: param_text(first, cp::SRVRLSLV)?,
            },
            cp::ACCSECRD => {
                let mut mechanisms = Vec::new();
                if let Some(secmec) = first.param(cp::SECMEC)? {
                    let mut buf = ReadBuffer::new(secmec.body);
                    while buf.has_remaining(2) {
                        mechanisms.push(buf.read_u16()?);
                    }
                }
                Reply::SecurityAccepted {
                    mechanisms,
                    token: first.param(cp::SECTKN)?.map(|t| t.body.to_vec()),
                }
            }
            cp::SECCHKRM => {
                let code = first
                    .param(cp::SECCHKCD)?
                    .ok_or_else(|| SqlException::protocol("SECCHKRM without SECCHKCD"))?;
                Reply::SecurityChecked {
                    check_code: code.body.first().copied().unwrap_or(0xFF),
                    sqlcard,
                }
            }
            cp::ACCRDBRM => Reply::RdbAccessed { sqlcard },
            cp::ENDUOWRM => Reply::EndUnitOfWork { sqlcard },
            cp::SQLCARD => {
                let mut values = Vec::new();
                if let Some(data) = rest.iter().find(|o| o.code_point == cp::SQLDTARD) {
                    let mut buf = ReadBuffer::new(data.body.clone());
                    let count = buf.read_u16()? as usize;
                    for _ in 0..count {
                        values.push(Value::decode(&mut buf)?);
                    }
                }
                Reply::Sql {
                    sqlcard: Some(first.body.clone()),
                    values,
                }
            }
            other => {
                return Err(SqlException::protocol(format!(
                    "unexpected reply code point 0x{:04X}",
                    other
                )))
            }
        };
        Ok(reply)
    }
}

fn write_sqlcard(buf: &mut WriteBuffer, sqlcard: &Option<Bytes>) {
    if let Some(card) = sqlcard {
        buf.write_ddm_param(cp::SQLCARD, card);
    }
}

fn find_sqlcard(objects: &[DdmObject]) -> Option<Bytes> {
    objects
        .iter()
        .find(|o| o.code_point == cp::SQLCARD)
        .map(|o| o.body.clone())
}

fn param_text(object: &DdmObject, code_point: u16) -> SqlResult<String> {
    Ok(object
        .param(code_point)?
        .map(|p| p.as_string())
        .unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostic::Diagnostic;

    #[test]
    fn test_sql_reply_with_values() {
        let card = Diagnostic::new(0, "00000").to_wire();
        let reply = Reply::Sql {
            sqlcard: Some(card),
            values: vec![Value::Integer(17), Value::Null],
        };
        assert_eq!(Reply::decode(reply.encode()).unwrap(), reply);
    }

    #[test]
    fn test_security_accepted_lists_mechanisms() {
        let reply = Reply::SecurityAccepted {
            mechanisms: vec![3, 9],
            token: None,
        };
        match Reply::decode(reply.encode()).unwrap() {
            Reply::SecurityAccepted { mechanisms, token } => {
                assert_eq!(mechanisms, vec![3, 9]);
                assert!(token.is_none());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_security_checked_carries_sqlcard() {
        let card = Diagnostic::new(-4499, "08004").to_wire();
        let reply = Reply::SecurityChecked {
            check_code: 0x0F,
            sqlcard: Some(card.clone()),
        };
        let decoded = Reply::decode(reply.encode()).unwrap();
        assert_eq!(decoded.sqlcard(), Some(&card));
    }

    #[test]
    fn test_unknown_reply_is_protocol_error() {
        let mut buf = WriteBuffer::new();
        buf.write_ddm_param(0x9999, &[]);
        assert_eq!(
            Reply::decode(buf.freeze()).unwrap_err().sql_state(),
            "58009"
        );
    }
}
